//
// registry.rs
// Dicom-Frames-rs
//
// Durable asset registry: one JSON record per asset id, written atomically, upserts serialized per key.
//
// Thales Matheus Mendonça Santos - November 2025

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{RenderError, Result};
use crate::models::{ImagingAsset, StudyRecord};

const RECORDS_DIR: &str = "records";
/// Hex characters kept from the identifier digest.
const ASSET_ID_LEN: usize = 32;

/// What to do when an asset id already exists with different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    Reject,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,
    /// Same content was already registered under this id.
    Existing,
    Replaced,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub asset_id: String,
    pub outcome: RegistrationOutcome,
}

/// Deterministic id for a logical study: patient, origin filename and ingestion day.
pub fn asset_id_for(patient_id: &str, origin_filename: &str, date: NaiveDate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(patient_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(origin_filename.as_bytes());
    hasher.update([0u8]);
    hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..ASSET_ID_LEN].to_string()
}

fn is_asset_id(candidate: &str) -> bool {
    candidate.len() == ASSET_ID_LEN && candidate.chars().all(|c| c.is_ascii_hexdigit())
}

type StudyKey = (String, String);

pub struct AssetRegistry {
    records: PathBuf,
    /// Held only while a registration for that id is in flight.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Newest `(created_at, asset_id)` per `(patient_id, origin_filename)`.
    studies: DashMap<StudyKey, (DateTime<Utc>, String)>,
}

impl AssetRegistry {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let records = root.as_ref().join(RECORDS_DIR);
        std::fs::create_dir_all(&records)?;
        let registry = Self {
            records,
            locks: DashMap::new(),
            studies: DashMap::new(),
        };
        for record in scan_records(&registry.records, |_| true)? {
            registry.index(&record);
        }
        debug!(studies = registry.studies.len(), "registry index loaded");
        Ok(registry)
    }

    fn index(&self, record: &StudyRecord) {
        let key = (record.patient_id.clone(), record.origin_filename.clone());
        let candidate = (record.created_at, record.asset_id.clone());
        self.studies
            .entry(key)
            .and_modify(|newest| {
                if candidate > *newest {
                    *newest = candidate.clone();
                }
            })
            .or_insert_with(|| candidate.clone());
    }

    fn record_path(&self, asset_id: &str) -> PathBuf {
        self.records.join(format!("{}.json", asset_id))
    }

    fn key_lock(&self, asset_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(asset_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Registers under today's UTC date, rejecting conflicting content.
    pub async fn register(
        &self,
        asset: &ImagingAsset,
        patient_id: &str,
        origin_filename: &str,
    ) -> Result<String> {
        self.register_on(asset, patient_id, origin_filename, Utc::now().date_naive())
            .await
    }

    /// Same as [`register`](Self::register) with an explicit ingestion date.
    pub async fn register_on(
        &self,
        asset: &ImagingAsset,
        patient_id: &str,
        origin_filename: &str,
        date: NaiveDate,
    ) -> Result<String> {
        self.register_with(asset, patient_id, origin_filename, date, ConflictPolicy::Reject)
            .await
            .map(|r| r.asset_id)
    }

    pub async fn register_with(
        &self,
        asset: &ImagingAsset,
        patient_id: &str,
        origin_filename: &str,
        date: NaiveDate,
        policy: ConflictPolicy,
    ) -> Result<Registration> {
        let asset_id = asset_id_for(patient_id, origin_filename, date);
        let lock = self.key_lock(&asset_id);
        let result = {
            let _guard = lock.lock().await;
            self.register_locked(asset_id.clone(), asset, patient_id, origin_filename, date, policy)
                .await
        };
        self.release_lock(&asset_id, &lock);
        result
    }

    /// Drops the per-key lock once nobody else holds or waits on it.
    fn release_lock(&self, asset_id: &str, lock: &Arc<Mutex<()>>) {
        self.locks.remove_if(asset_id, |_, current| {
            Arc::ptr_eq(current, lock) && Arc::strong_count(current) == 2
        });
    }

    async fn register_locked(
        &self,
        asset_id: String,
        asset: &ImagingAsset,
        patient_id: &str,
        origin_filename: &str,
        date: NaiveDate,
        policy: ConflictPolicy,
    ) -> Result<Registration> {
        let outcome = match self.read_record(&asset_id).await {
            Ok(existing) if existing.metadata.content_id == asset.content_id => {
                debug!(%asset_id, "asset already registered with identical content");
                return Ok(Registration {
                    asset_id,
                    outcome: RegistrationOutcome::Existing,
                });
            }
            Ok(_) if policy == ConflictPolicy::Reject => {
                warn!(%asset_id, patient_id, origin_filename, "registration conflict");
                return Err(RenderError::RegistryConflict { asset_id });
            }
            Ok(_) => RegistrationOutcome::Replaced,
            Err(RenderError::NotFound(_)) => RegistrationOutcome::Created,
            Err(err) => return Err(err),
        };

        let now = Utc::now();
        let created_at = if now.date_naive() == date {
            now
        } else {
            date.and_hms_opt(0, 0, 0)
                .map(|midnight| Utc.from_utc_datetime(&midnight))
                .unwrap_or(now)
        };
        let record = StudyRecord {
            asset_id: asset_id.clone(),
            patient_id: patient_id.to_string(),
            origin_filename: origin_filename.to_string(),
            created_at,
            file_size: asset.byte_size,
            metadata: asset.clone(),
        };
        self.write_record(&record).await?;
        self.index(&record);
        info!(%asset_id, patient_id, origin_filename, ?outcome, "asset registered");

        Ok(Registration { asset_id, outcome })
    }

    async fn write_record(&self, record: &StudyRecord) -> Result<()> {
        let path = self.record_path(&record.asset_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;
        write_atomically(&tmp, &path, &json).await
    }

    async fn read_record(&self, asset_id: &str) -> Result<StudyRecord> {
        if !is_asset_id(asset_id) {
            return Err(RenderError::NotFound(asset_id.to_string()));
        }
        match tokio::fs::read(self.record_path(asset_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(RenderError::NotFound(asset_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn lookup(&self, asset_id: &str) -> Result<StudyRecord> {
        self.read_record(asset_id).await
    }

    /// Every record of a patient, oldest first.
    pub async fn list_for_patient(&self, patient_id: &str) -> Result<Vec<StudyRecord>> {
        let records = self.records.clone();
        let patient = patient_id.to_string();
        tokio::task::spawn_blocking(move || scan_records(&records, |r| r.patient_id == patient))
            .await?
    }

    /// Newest record for a patient's origin filename.
    pub async fn find(&self, patient_id: &str, origin_filename: &str) -> Result<StudyRecord> {
        let key = (patient_id.to_string(), origin_filename.to_string());
        let indexed = self.studies.get(&key).map(|entry| entry.value().1.clone());
        if let Some(asset_id) = indexed {
            match self.read_record(&asset_id).await {
                Ok(record) => return Ok(record),
                Err(RenderError::NotFound(_)) => {
                    debug!(%asset_id, "indexed record vanished, rescanning");
                    self.studies.remove(&key);
                }
                Err(err) => return Err(err),
            }
        }

        let mut matching: Vec<_> = self
            .list_for_patient(patient_id)
            .await?
            .into_iter()
            .filter(|r| r.origin_filename == origin_filename)
            .collect();
        let newest = matching.pop().ok_or_else(|| {
            RenderError::NotFound(format!("{}/{}", patient_id, origin_filename))
        })?;
        self.index(&newest);
        Ok(newest)
    }
}

/// Writes `bytes` to `tmp`, flushes it to disk, then renames it over `path`.
///
/// Readers only ever see a complete record. The temp file is removed when any step fails.
async fn write_atomically(tmp: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let written = async {
        let mut file = tokio::fs::File::create(tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(tmp, path).await
    }
    .await;
    if let Err(err) = written {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(err.into());
    }
    Ok(())
}

fn scan_records<F>(dir: &Path, keep: F) -> Result<Vec<StudyRecord>>
where
    F: Fn(&StudyRecord) -> bool,
{
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).max_depth(1).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        let bytes = std::fs::read(path)?;
        match serde_json::from_slice::<StudyRecord>(&bytes) {
            Ok(record) if keep(&record) => found.push(record),
            Ok(_) => {}
            Err(err) => warn!(path = %path.display(), "skipping unreadable record: {}", err),
        }
    }
    found.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.asset_id.cmp(&b.asset_id))
    });
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Photometric, PixelEncoding, PixelRepresentation};
    use tempfile::tempdir;

    fn asset(content_id: &str) -> ImagingAsset {
        ImagingAsset {
            content_id: content_id.into(),
            storage_path: PathBuf::from(format!("{}.dcm", content_id)),
            byte_size: 1024,
            transfer_syntax: "1.2.840.10008.1.2.1".into(),
            encoding: PixelEncoding::Native,
            rows: 4,
            columns: 4,
            samples_per_pixel: 1,
            bits_allocated: 16,
            bits_stored: 12,
            high_bit: 11,
            pixel_representation: PixelRepresentation::Unsigned,
            photometric_interpretation: Photometric::Monochrome2,
            planar_configuration: 0,
            frame_count: 3,
            windows: vec![],
            pixel_spacing: None,
            rescale_slope: None,
            rescale_intercept: None,
            modality: Some("CT".into()),
            pixel_data: None,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, d).unwrap()
    }

    #[test]
    fn asset_id_depends_on_patient_file_and_day() {
        let base = asset_id_for("p1", "scan.dcm", day(3));
        assert_eq!(base.len(), ASSET_ID_LEN);
        assert_eq!(base, asset_id_for("p1", "scan.dcm", day(3)));
        assert_ne!(base, asset_id_for("p2", "scan.dcm", day(3)));
        assert_ne!(base, asset_id_for("p1", "other.dcm", day(3)));
        assert_ne!(base, asset_id_for("p1", "scan.dcm", day(4)));
        // The separator keeps field boundaries apart.
        assert_ne!(asset_id_for("p1s", "can.dcm", day(3)), base);
    }

    #[tokio::test]
    async fn register_is_idempotent_for_same_content() {
        let dir = tempdir().unwrap();
        let registry = AssetRegistry::open(dir.path()).unwrap();
        let first = registry.register_on(&asset("c1"), "p1", "scan.dcm", day(3)).await.unwrap();
        let second = registry.register_on(&asset("c1"), "p1", "scan.dcm", day(3)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.list_for_patient("p1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_content_under_same_id_conflicts() {
        let dir = tempdir().unwrap();
        let registry = AssetRegistry::open(dir.path()).unwrap();
        let id = registry.register_on(&asset("c1"), "p1", "scan.dcm", day(3)).await.unwrap();

        let err = registry
            .register_on(&asset("c2"), "p1", "scan.dcm", day(3))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::RegistryConflict { ref asset_id } if *asset_id == id));
        assert_eq!(registry.lookup(&id).await.unwrap().metadata.content_id, "c1");

        let replaced = registry
            .register_with(&asset("c2"), "p1", "scan.dcm", day(3), ConflictPolicy::Replace)
            .await
            .unwrap();
        assert_eq!(replaced.outcome, RegistrationOutcome::Replaced);
        assert_eq!(registry.lookup(&id).await.unwrap().metadata.content_id, "c2");
    }

    #[tokio::test]
    async fn lookup_unknown_or_malformed_id_is_not_found() {
        let dir = tempdir().unwrap();
        let registry = AssetRegistry::open(dir.path()).unwrap();
        assert!(matches!(
            registry.lookup(&"0".repeat(ASSET_ID_LEN)).await,
            Err(RenderError::NotFound(_))
        ));
        assert!(matches!(
            registry.lookup("../../etc/passwd").await,
            Err(RenderError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_distinct_registrations_all_persist() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(AssetRegistry::open(dir.path()).unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .register_on(&asset(&format!("c{}", i)), "p1", &format!("f{}.dcm", i), day(3))
                    .await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 16);

        let listed = registry.list_for_patient("p1").await.unwrap();
        assert_eq!(listed.len(), 16);
        for record in &listed {
            assert_eq!(registry.lookup(&record.asset_id).await.unwrap(), *record);
        }
    }

    #[tokio::test]
    async fn failed_rename_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("occupied");
        std::fs::create_dir_all(target.join("inner")).unwrap();
        let tmp = dir.path().join("occupied.json.tmp");

        assert!(write_atomically(&tmp, &target, b"{}").await.is_err());
        assert!(!tmp.exists());

        let ok = dir.path().join("fresh.json");
        write_atomically(&dir.path().join("fresh.json.tmp"), &ok, b"{}")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&ok).unwrap(), b"{}");
        assert!(!dir.path().join("fresh.json.tmp").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn per_key_locks_are_released_after_registration() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(AssetRegistry::open(dir.path()).unwrap());

        let mut handles = Vec::new();
        for i in 0..12 {
            let registry = Arc::clone(&registry);
            // Pairs of requests race on the same id.
            handles.push(tokio::spawn(async move {
                registry
                    .register_on(&asset("c1"), "p1", &format!("f{}.dcm", i / 2), day(3))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(registry.locks.is_empty());
        assert_eq!(registry.list_for_patient("p1").await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn study_index_survives_reopen() {
        let dir = tempdir().unwrap();
        let newest = {
            let registry = AssetRegistry::open(dir.path()).unwrap();
            registry.register_on(&asset("c1"), "p1", "scan.dcm", day(1)).await.unwrap();
            registry.register_on(&asset("c2"), "p1", "scan.dcm", day(2)).await.unwrap()
        };

        let reopened = AssetRegistry::open(dir.path()).unwrap();
        let key = ("p1".to_string(), "scan.dcm".to_string());
        assert_eq!(reopened.studies.get(&key).map(|e| e.value().1.clone()), Some(newest.clone()));
        assert_eq!(reopened.find("p1", "scan.dcm").await.unwrap().asset_id, newest);

        // A record removed behind the index's back falls back to a scan.
        std::fs::remove_file(reopened.record_path(&newest)).unwrap();
        let older = reopened.find("p1", "scan.dcm").await.unwrap();
        assert_eq!(older.metadata.content_id, "c1");
    }

    #[tokio::test]
    async fn listing_is_ordered_and_find_returns_newest() {
        let dir = tempdir().unwrap();
        let registry = AssetRegistry::open(dir.path()).unwrap();
        let old = registry.register_on(&asset("c1"), "p1", "scan.dcm", day(1)).await.unwrap();
        let new = registry.register_on(&asset("c2"), "p1", "scan.dcm", day(2)).await.unwrap();
        registry.register_on(&asset("c3"), "p2", "scan.dcm", day(2)).await.unwrap();

        let listed: Vec<_> = registry
            .list_for_patient("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.asset_id)
            .collect();
        assert_eq!(listed, vec![old, new.clone()]);
        assert_eq!(registry.find("p1", "scan.dcm").await.unwrap().asset_id, new);
        assert!(matches!(
            registry.find("p1", "missing.dcm").await,
            Err(RenderError::NotFound(_))
        ));
    }
}
