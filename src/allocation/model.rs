use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const COUNTERS_ROOT: &str = "counters/";
pub const IDS_ROOT: &str = "ids/";
pub const ACTIVE_ROOT: &str = "active/";
pub const RECORDS_ROOT: &str = "records/";

/// The (location, region) pair that scopes all counters and identifiers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub location: String,
    pub region: String,
}

impl Partition {
    pub fn new(location: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            region: region.into(),
        }
    }

    pub fn counter_path(&self) -> String {
        format!("{COUNTERS_ROOT}{}/{}", self.location, self.region)
    }

    pub fn id_counter_path(&self) -> String {
        format!("{IDS_ROOT}{}/{}", self.location, self.region)
    }

    /// Root of the record container for one bundle. Individual records live
    /// under `items/`, the force-completion audit marker under `meta`.
    pub fn bundle_container_path(&self, bundle_no: u64) -> String {
        format!("{RECORDS_ROOT}{}/{}/{bundle_no}", self.location, self.region)
    }

    pub fn bundle_meta_path(&self, bundle_no: u64) -> String {
        format!("{}/meta", self.bundle_container_path(bundle_no))
    }

    pub fn record_path(&self, bundle_no: u64, unique_id: &str) -> String {
        format!("{}/items/{unique_id}", self.bundle_container_path(bundle_no))
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location, self.region)
    }
}

pub fn active_path(worker_id: &str, region: &str) -> String {
    format!("{ACTIVE_ROOT}{worker_id}/{region}")
}

/// Per-partition allocation counter.
///
/// `gaps` holds numbers recycled by reset; storage order is arbitrary but
/// they are always consumed in ascending order, before `next_bundle` grows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleCounter {
    pub next_bundle: u64,
    pub gaps: Vec<u64>,
}

impl Default for BundleCounter {
    fn default() -> Self {
        Self {
            next_bundle: 1,
            gaps: Vec::new(),
        }
    }
}

impl BundleCounter {
    /// Takes the smallest recycled number if any, otherwise advances
    /// `next_bundle`. Returns the issued number and whether it came from
    /// the gap pool.
    pub fn allocate(&mut self) -> (u64, bool) {
        if let Some(&min) = self.gaps.iter().min() {
            self.gaps.retain(|&g| g != min);
            (min, true)
        } else {
            let n = self.next_bundle;
            self.next_bundle += 1;
            (n, false)
        }
    }

    /// Returns `bundle_no` to the pool. Idempotent.
    pub fn recycle(&mut self, bundle_no: u64) {
        if !self.gaps.contains(&bundle_no) {
            self.gaps.push(bundle_no);
        }
    }
}

/// A worker's at-most-one active bundle within a region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveBundle {
    pub bundle_no: u64,
    /// Number of records submitted into this bundle so far.
    pub count: u64,
    pub region: String,
}

impl ActiveBundle {
    pub fn new(bundle_no: u64, region: impl Into<String>) -> Self {
        Self {
            bundle_no,
            count: 0,
            region: region.into(),
        }
    }
}

/// One processed record inside a bundle container. Immutable once written;
/// only the container-level force-completion marker is added later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub unique_id: String,
    pub bundle_no: u64,
    pub processed_by: String,
    pub processed_at: DateTime<Utc>,
    pub source_file: String,
    pub region: String,
    /// Caller-supplied attributes beyond the required fields.
    #[serde(flatten)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

/// Permanent audit marker on a bundle's record container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleAudit {
    pub is_force_completed: bool,
    pub force_completed_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_counter_issues_one_then_grows() {
        let mut c = BundleCounter::default();
        assert_eq!(c.allocate(), (1, false));
        assert_eq!(c.next_bundle, 2);
        assert_eq!(c.allocate(), (2, false));
        assert_eq!(c.next_bundle, 3);
        assert!(c.gaps.is_empty());
    }

    #[test]
    fn gap_reuse_precedes_growth_and_picks_minimum() {
        let mut c = BundleCounter {
            next_bundle: 10,
            gaps: vec![7, 3],
        };
        assert_eq!(c.allocate(), (3, true));
        assert_eq!(c.next_bundle, 10, "next_bundle untouched by gap reuse");
        assert_eq!(c.allocate(), (7, true));
        assert_eq!(c.allocate(), (10, false));
        assert_eq!(c.next_bundle, 11);
    }

    #[test]
    fn recycle_is_idempotent() {
        let mut c = BundleCounter::default();
        c.recycle(4);
        c.recycle(4);
        assert_eq!(c.gaps, vec![4]);
    }

    #[test]
    fn end_to_end_counter_sequence() {
        // assign, assign, reset first, assign (reuses), assign (grows)
        let mut c = BundleCounter::default();
        assert_eq!(c.allocate().0, 1);
        assert_eq!(c.allocate().0, 2);
        c.recycle(1);
        assert_eq!(c, BundleCounter { next_bundle: 3, gaps: vec![1] });
        assert_eq!(c.allocate(), (1, true));
        assert_eq!(c, BundleCounter { next_bundle: 3, gaps: vec![] });
        assert_eq!(c.allocate(), (3, false));
        assert_eq!(c.next_bundle, 4);
    }

    #[test]
    fn paths_are_partition_scoped() {
        let p = Partition::new("palghar", "Vasai");
        assert_eq!(p.counter_path(), "counters/palghar/Vasai");
        assert_eq!(p.id_counter_path(), "ids/palghar/Vasai");
        assert_eq!(p.bundle_container_path(3), "records/palghar/Vasai/3");
        assert_eq!(p.bundle_meta_path(3), "records/palghar/Vasai/3/meta");
        assert_eq!(
            p.record_path(3, "PAVA7"),
            "records/palghar/Vasai/3/items/PAVA7"
        );
        assert_eq!(active_path("u1", "Vasai"), "active/u1/Vasai");
    }

    #[test]
    fn processed_record_roundtrips_with_open_attrs() {
        let mut attrs = serde_json::Map::new();
        attrs.insert("crop".to_string(), serde_json::json!("rice"));

        let rec = ProcessedRecord {
            unique_id: "PAVA1".to_string(),
            bundle_no: 2,
            processed_by: "u1".to_string(),
            processed_at: Utc::now(),
            source_file: "sheet-17.xlsx".to_string(),
            region: "Vasai".to_string(),
            attrs,
        };

        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["crop"], "rice", "open attributes flatten to top level");
        let back: ProcessedRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, rec);
    }
}
