//! Local cache of nearby crates with a movement-triggered refetch policy
//!
//! The cache is rebuilt wholesale from each fetch result. Crates already in
//! the durable DedupSet, or collected earlier in this session, are filtered
//! out before they become visible, so a collected crate never reappears even
//! if the remote store still returns it.

use crate::domain::geo::distance_m;
use crate::domain::types::{Coordinates, Crate, CrateId, FetchRequest};
use crate::error::StorageError;
use crate::infra::config::Config;
use crate::io::dedup::DedupSet;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

pub struct ProximityIndex {
    crates: FxHashMap<CrateId, Crate>,
    /// Center of the last successful fetch
    last_fetch: Option<FetchRequest>,
    /// Crates collected (or found already collected) during this session
    session_collected: FxHashSet<CrateId>,
    dedup: DedupSet,
    refetch_distance_m: f64,
    fetch_radius_m: f64,
}

impl ProximityIndex {
    pub fn new(config: &Config, dedup: DedupSet) -> Self {
        Self {
            crates: FxHashMap::default(),
            last_fetch: None,
            session_collected: FxHashSet::default(),
            dedup,
            refetch_distance_m: config.refetch_distance_m(),
            fetch_radius_m: config.fetch_radius_m(),
        }
    }

    /// A fetch request if the observer has never fetched or has moved past the refetch distance
    pub fn maybe_refetch<P: Coordinates + ?Sized>(&self, position: &P) -> Option<FetchRequest> {
        let due = match &self.last_fetch {
            None => true,
            Some(last) => distance_m(last, position) > self.refetch_distance_m,
        };
        due.then(|| FetchRequest {
            latitude: position.latitude(),
            longitude: position.longitude(),
            radius_m: self.fetch_radius_m,
        })
    }

    /// Replace the cache with a fetch result, minus anything already collected
    ///
    /// On a storage error the previous cache and fetch position are kept, so
    /// the refetch stays due.
    pub fn apply_fetch_result(
        &mut self,
        request: &FetchRequest,
        crates: Vec<Crate>,
    ) -> Result<usize, StorageError> {
        let collected = self.dedup.load()?;
        let fetched = crates.len();

        self.crates = crates
            .into_iter()
            .filter(|c| !collected.contains(&c.id) && !self.session_collected.contains(&c.id))
            .map(|c| (c.id.clone(), c))
            .collect();
        self.last_fetch = Some(*request);

        info!(
            fetched = %fetched,
            visible = %self.crates.len(),
            radius_m = %request.radius_m,
            "proximity_index_refreshed"
        );
        Ok(self.crates.len())
    }

    /// Drop a crate from the visible set and keep it out of later fetch results
    pub fn remove(&mut self, id: &CrateId) -> Option<Crate> {
        self.session_collected.insert(id.clone());
        let removed = self.crates.remove(id);
        if removed.is_some() {
            debug!(crate_id = %id, remaining = %self.crates.len(), "proximity_index_removed");
        }
        removed
    }

    /// Visible crates within `radius_m` of `position`, nearest first
    pub fn within<P: Coordinates + ?Sized>(&self, position: &P, radius_m: f64) -> Vec<(&Crate, f64)> {
        let mut hits: Vec<(&Crate, f64)> = self
            .crates
            .values()
            .map(|c| (c, distance_m(position, c)))
            .filter(|(_, d)| *d <= radius_m)
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits
    }

    pub fn visible(&self) -> impl Iterator<Item = &Crate> {
        self.crates.values()
    }

    pub fn contains(&self, id: &CrateId) -> bool {
        self.crates.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.crates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crates.is_empty()
    }

    pub fn last_fetch_position(&self) -> Option<&FetchRequest> {
        self.last_fetch.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::destination;
    use crate::domain::types::StablePosition;
    use crate::io::durable::MemoryStore;
    use std::sync::Arc;

    const LAT: f64 = 48.8584;
    const LON: f64 = 2.2945;

    fn index(config: &Config) -> (ProximityIndex, DedupSet) {
        let dedup = DedupSet::new(Arc::new(MemoryStore::new()));
        (ProximityIndex::new(config, dedup.clone()), dedup)
    }

    fn moved(meters: f64) -> StablePosition {
        let (lat, lon) = destination(LAT, LON, 33.0, meters);
        StablePosition::at(lat, lon)
    }

    #[test]
    fn test_first_position_always_fetches() {
        let config = Config::default();
        let (idx, _) = index(&config);
        let req = idx.maybe_refetch(&StablePosition::at(LAT, LON)).unwrap();
        assert_eq!(req.radius_m, 100.0);
        assert_eq!((req.latitude, req.longitude), (LAT, LON));
    }

    #[test]
    fn test_refetch_threshold() {
        let config = Config::default().with_refetch_distance_m(100.0).with_radar_max_range_m(50.0);
        let (mut idx, _) = index(&config);

        let origin = StablePosition::at(LAT, LON);
        let req = idx.maybe_refetch(&origin).unwrap();
        idx.apply_fetch_result(&req, Vec::new()).unwrap();

        assert!(idx.maybe_refetch(&moved(99.0)).is_none());
        let req = idx.maybe_refetch(&moved(101.0)).unwrap();
        assert_eq!(req.radius_m, 100.0);
    }

    #[test]
    fn test_failed_fetch_stays_due() {
        let config = Config::default();
        let (idx, _) = index(&config);
        let origin = StablePosition::at(LAT, LON);
        // Nothing applied: the next tick asks again
        assert!(idx.maybe_refetch(&origin).is_some());
        assert!(idx.maybe_refetch(&origin).is_some());
        assert!(idx.last_fetch_position().is_none());
    }

    #[test]
    fn test_collected_crates_never_reappear() {
        let config = Config::default();
        let (mut idx, dedup) = index(&config);
        let req = idx.maybe_refetch(&StablePosition::at(LAT, LON)).unwrap();
        let crates = || {
            vec![
                Crate::new("a", LAT, LON, "p"),
                Crate::new("b", LAT, LON, "p"),
                Crate::new("c", LAT, LON, "p"),
            ]
        };

        dedup.insert(&CrateId::from("a")).unwrap();
        assert_eq!(idx.apply_fetch_result(&req, crates()).unwrap(), 2);
        assert!(!idx.contains(&CrateId::from("a")));

        // Session removal without a durable write still excludes it
        assert!(idx.remove(&CrateId::from("b")).is_some());
        assert_eq!(idx.len(), 1);

        // Remote still returns everything due to caching lag
        assert_eq!(idx.apply_fetch_result(&req, crates()).unwrap(), 1);
        assert!(idx.contains(&CrateId::from("c")));
    }

    #[test]
    fn test_refresh_replaces_cache() {
        let config = Config::default();
        let (mut idx, _) = index(&config);
        let req = idx.maybe_refetch(&StablePosition::at(LAT, LON)).unwrap();

        idx.apply_fetch_result(&req, vec![Crate::new("old", LAT, LON, "p")]).unwrap();
        idx.apply_fetch_result(&req, vec![Crate::new("new", LAT, LON, "p")]).unwrap();

        assert!(!idx.contains(&CrateId::from("old")));
        assert!(idx.contains(&CrateId::from("new")));
    }

    #[test]
    fn test_within_sorted_by_distance() {
        let config = Config::default();
        let (mut idx, _) = index(&config);
        let origin = StablePosition::at(LAT, LON);
        let req = idx.maybe_refetch(&origin).unwrap();

        let at = |m: f64| destination(LAT, LON, 90.0, m);
        let (l1, o1) = at(8.0);
        let (l2, o2) = at(3.0);
        let (l3, o3) = at(40.0);
        idx.apply_fetch_result(
            &req,
            vec![Crate::new("eight", l1, o1, "p"), Crate::new("three", l2, o2, "p"), Crate::new("forty", l3, o3, "p")],
        )
        .unwrap();

        let hits = idx.within(&origin, 10.0);
        let ids: Vec<&str> = hits.iter().map(|(c, _)| c.id.0.as_str()).collect();
        assert_eq!(ids, vec!["three", "eight"]);
        assert!((hits[0].1 - 3.0).abs() < 0.01);
    }
}
