//! Resource + proxy pairs
//!
//! Every guest object the bridge forwards has exactly one host proxy. Both
//! sides carry the same [`PairKey`] as user data. Whichever side reports its
//! destruction first removes the pair and receives the other side to tear
//! down; the echo from that teardown finds a stale key and does nothing.

use super::arena::{Arena, Key};

pub struct Pair<R, P, D = ()> {
    pub resource: R,
    pub proxy: P,
    pub data: D,
}

pub type PairKey<R, P, D = ()> = Key<Pair<R, P, D>>;

/// What the caller must tear down after one side went away.
#[derive(Debug, PartialEq, Eq)]
pub enum Teardown<T, D> {
    /// First destruction: sever the returned opposite side and drop `data`.
    Sever { other: T, data: D },
    /// The pair was already gone; nothing to do.
    AlreadyGone,
}

pub struct PairTable<R, P, D = ()> {
    pairs: Arena<Pair<R, P, D>>,
}

impl<R, P, D> Default for PairTable<R, P, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, P, D> PairTable<R, P, D> {
    pub fn new() -> Self {
        Self { pairs: Arena::new() }
    }

    pub fn insert(&mut self, resource: R, proxy: P, data: D) -> PairKey<R, P, D> {
        self.pairs.insert(Pair {
            resource,
            proxy,
            data,
        })
    }

    /// Create both sides from the key they will share.
    pub fn insert_with(
        &mut self,
        build: impl FnOnce(PairKey<R, P, D>) -> (R, P, D),
    ) -> PairKey<R, P, D> {
        self.pairs.insert_with(|key| {
            let (resource, proxy, data) = build(key);
            Pair {
                resource,
                proxy,
                data,
            }
        })
    }

    pub fn get(&self, key: PairKey<R, P, D>) -> Option<&Pair<R, P, D>> {
        self.pairs.get(key)
    }

    pub fn get_mut(&mut self, key: PairKey<R, P, D>) -> Option<&mut Pair<R, P, D>> {
        self.pairs.get_mut(key)
    }

    pub fn proxy(&self, key: PairKey<R, P, D>) -> Option<&P> {
        self.pairs.get(key).map(|p| &p.proxy)
    }

    pub fn resource(&self, key: PairKey<R, P, D>) -> Option<&R> {
        self.pairs.get(key).map(|p| &p.resource)
    }

    pub fn data(&self, key: PairKey<R, P, D>) -> Option<&D> {
        self.pairs.get(key).map(|p| &p.data)
    }

    pub fn data_mut(&mut self, key: PairKey<R, P, D>) -> Option<&mut D> {
        self.pairs.get_mut(key).map(|p| &mut p.data)
    }

    /// The guest resource was destroyed.
    pub fn resource_destroyed(&mut self, key: PairKey<R, P, D>) -> Teardown<P, D> {
        match self.pairs.remove(key) {
            Some(pair) => Teardown::Sever {
                other: pair.proxy,
                data: pair.data,
            },
            None => Teardown::AlreadyGone,
        }
    }

    /// The host proxy was destroyed by the host.
    pub fn proxy_destroyed(&mut self, key: PairKey<R, P, D>) -> Teardown<R, D> {
        match self.pairs.remove(key) {
            Some(pair) => Teardown::Sever {
                other: pair.resource,
                data: pair.data,
            },
            None => Teardown::AlreadyGone,
        }
    }

    /// Remove every pair matching `pred`, as if its host side went away. Keys
    /// held by either side become stale.
    pub fn sever_where(&mut self, mut pred: impl FnMut(&Pair<R, P, D>) -> bool) -> Vec<Pair<R, P, D>> {
        let doomed: Vec<_> = self
            .pairs
            .iter()
            .filter(|(_, pair)| pred(pair))
            .map(|(key, _)| key)
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| self.pairs.remove(key))
            .collect()
    }

    pub fn contains(&self, key: PairKey<R, P, D>) -> bool {
        self.pairs.contains(key)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PairKey<R, P, D>, &Pair<R, P, D>)> {
        self.pairs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PairKey<R, P, D>, &mut Pair<R, P, D>)> {
        self.pairs.iter_mut()
    }

    pub fn find(&self, mut pred: impl FnMut(&Pair<R, P, D>) -> bool) -> Option<PairKey<R, P, D>> {
        self.pairs.find(|p| pred(p))
    }

    pub fn keys(&self) -> Vec<PairKey<R, P, D>> {
        self.pairs.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_destroy_owns_teardown() {
        let mut table: PairTable<&str, &str> = PairTable::new();
        let key = table.insert("resource", "proxy", ());
        assert_eq!(
            table.resource_destroyed(key),
            Teardown::Sever {
                other: "proxy",
                data: ()
            }
        );
        // the proxy teardown echoes back
        assert_eq!(table.proxy_destroyed(key), Teardown::AlreadyGone);
        assert!(table.is_empty());
    }

    #[test]
    fn test_proxy_side_first() {
        let mut table: PairTable<u32, u32, String> = PairTable::new();
        let key = table.insert(1, 2, "state".into());
        match table.proxy_destroyed(key) {
            Teardown::Sever { other, data } => {
                assert_eq!(other, 1);
                assert_eq!(data, "state");
            }
            Teardown::AlreadyGone => panic!("pair should still exist"),
        }
        assert_eq!(table.resource_destroyed(key), Teardown::AlreadyGone);
    }

    #[test]
    fn test_sever_where_leaves_stale_keys() {
        let mut table: PairTable<u32, u32, u32> = PairTable::new();
        let first = table.insert(1, 101, 7);
        let other = table.insert(2, 102, 8);
        let second = table.insert(3, 103, 7);

        let severed = table.sever_where(|pair| pair.data == 7);
        let mut proxies: Vec<u32> = severed.iter().map(|p| p.proxy).collect();
        proxies.sort();
        assert_eq!(proxies, vec![101, 103]);
        assert_eq!(table.len(), 1);

        // the guest side goes away later and finds nothing to tear down
        assert_eq!(table.resource_destroyed(first), Teardown::AlreadyGone);
        assert_eq!(table.proxy_destroyed(second), Teardown::AlreadyGone);
        assert!(table.contains(other));
        assert!(table.sever_where(|pair| pair.data == 7).is_empty());
    }

    #[test]
    fn test_insert_with_shares_key() {
        let mut table: PairTable<u32, u32> = PairTable::new();
        let key = table.insert_with(|k| (k.index(), k.index() + 1, ()));
        let pair = table.get(key).unwrap();
        assert_eq!(pair.proxy, pair.resource + 1);
    }
}
