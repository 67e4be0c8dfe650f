//! Property-based tests for configuration module
//!
//! Random but valid configurations must validate, survive a TOML round trip
//! and keep validating after an environment overlay of valid values.

use super::*;
use proptest::prelude::*;

prop_compose! {
    fn valid_color()(rgb in 0u32..=0xff_ffff) -> String {
        format!("#{:06x}", rgb)
    }
}

prop_compose! {
    fn valid_bridge_config()(
        scale in 0.1f64..10.0,
        dpi in prop::collection::vec(72i32..=9600, 0..8),
        shm_driver in prop::option::of(prop_oneof![
            Just("noop".to_string()),
            Just("dmabuf".to_string()),
            Just("virtwl".to_string()),
            Just("virtwl-dmabuf".to_string()),
        ]),
        data_driver in prop::option::of(prop_oneof![
            Just("noop".to_string()),
            Just("virtwl".to_string()),
        ]),
        frame_color in valid_color(),
        dark_frame_color in valid_color(),
        clipboard_manager in any::<bool>(),
        glamor in any::<bool>(),
        exit_with_child in any::<bool>(),
        socket in "wayland-[0-9]{1,2}",
    ) -> BridgeConfig {
        BridgeConfig {
            socket,
            scale,
            dpi,
            shm_driver,
            data_driver,
            frame_color,
            dark_frame_color,
            clipboard_manager,
            glamor,
            exit_with_child,
            ..BridgeConfig::default()
        }
    }
}

prop_compose! {
    fn valid_config()(
        bridge in valid_bridge_config(),
        level in prop_oneof![
            Just("error".to_string()),
            Just("warn".to_string()),
            Just("info".to_string()),
            Just("debug".to_string()),
        ],
        log_pid in any::<bool>(),
    ) -> CrosswayConfig {
        CrosswayConfig {
            bridge,
            xwayland: XwaylandConfig::default(),
            logging: LoggingConfig {
                level,
                file: None,
                log_pid,
            },
        }
    }
}

proptest! {
    #[test]
    fn prop_valid_configs_validate(config in valid_config()) {
        prop_assert!(config.validate().is_ok());
    }

    #[test]
    fn prop_toml_roundtrip(config in valid_config()) {
        let text = toml::to_string(&config).unwrap();
        let restored: CrosswayConfig = toml::from_str(&text).unwrap();
        prop_assert_eq!(restored, config);
    }

    #[test]
    fn prop_out_of_range_scale_rejected(scale in prop_oneof![-100.0f64..0.099, 10.001f64..1000.0]) {
        let mut config = CrosswayConfig::default();
        config.bridge.scale = scale;
        prop_assert!(config.validate().is_err());
    }

    #[test]
    fn prop_color_parse_keeps_rgb(rgb in 0u32..=0xff_ffff) {
        let parsed = parse_color(&format!("#{:06X}", rgb)).unwrap();
        prop_assert_eq!(parsed & 0xff_ffff, rgb);
        prop_assert_eq!(parsed >> 24, 0xff);
    }

    #[test]
    fn prop_dpi_list_parses_what_it_prints(dpi in prop::collection::vec(72i32..=9600, 0..10)) {
        let text = dpi.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",");
        prop_assert_eq!(parse_dpi_list(&text).unwrap(), dpi);
    }

    #[test]
    fn prop_env_scale_overlay(config in valid_config(), scale in 0.1f64..10.0) {
        let mut config = config;
        let value = scale.to_string();
        config
            .apply_env_from(|name| (name == "SCALE").then(|| value.clone()))
            .unwrap();
        prop_assert_eq!(config.bridge.scale, scale);
        prop_assert!(config.validate().is_ok());
    }
}
