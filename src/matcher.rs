//! Calibration-frame matching.
//!
//! ```text
//!  sample files ──read metadata──▶ sample batch ──▶ signature (per kind) + time window
//!                                                            │
//!  <root>/raw/ob/** ─┐                                       ▼
//!                    ├─ image folders ─scan (rayon)─▶ hard filter ─▶ gap filter ─▶ rank ─▶ pick
//!  <root>/raw/df/** ─┘
//! ```
//!
//! Ranking among folders that pass the hard filter: smallest gap between the
//! folder's acquisition window and the sample window, then more matching
//! files, then lexical folder path. A folder without timestamps has an
//! infinite gap.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::InstrumentProfile;
use crate::data::filter::{conflicting_keys, filtered_indices, signature_filter};
use crate::data::loader::is_image_file;
use crate::data::model::{CalibrationKind, ImageBatch, ImageRecord, Signature, TimeWindow};
use crate::data::snapshot::FsSnapshot;
use crate::error::{Result, RockitError};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Calibration files of one kind, in path order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationSet {
    pub kind: CalibrationKind,
    pub files: Vec<PathBuf>,
}

impl CalibrationSet {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// How one calibration kind was picked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub kind: CalibrationKind,
    pub directory: PathBuf,
    pub files: usize,
    /// Seconds between the folder and the sample acquisition; `None` when
    /// either side has no timestamp.
    pub gap_s: Option<f64>,
    /// Folders holding images below the kind's subtrees.
    pub candidates: usize,
    /// Folders with at least one file matching the sample signature.
    pub compatible: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchDiagnostics {
    pub sample_files: usize,
    pub sample_window: Option<TimeWindow>,
    pub ob: Selection,
    pub dc: Selection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub ob: CalibrationSet,
    pub dc: CalibrationSet,
    pub diagnostics: MatchDiagnostics,
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Candidate folder that passed the hard filter.
#[derive(Debug)]
struct Candidate {
    directory: PathBuf,
    files: Vec<PathBuf>,
    gap: f64,
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.gap
        .total_cmp(&b.gap)
        .then_with(|| b.files.len().cmp(&a.files.len()))
        .then_with(|| a.directory.cmp(&b.directory))
}

/// Finds the OB and DC sets for a sample batch. Read-only.
pub struct CalibrationMatcher<'a, S: FsSnapshot + ?Sized> {
    profile: &'a InstrumentProfile,
    snapshot: &'a S,
}

impl<'a, S: FsSnapshot + ?Sized> CalibrationMatcher<'a, S> {
    pub fn new(profile: &'a InstrumentProfile, snapshot: &'a S) -> Self {
        Self { profile, snapshot }
    }

    pub fn match_calibration(
        &self,
        sample_files: &[PathBuf],
        experiment_root: &Path,
    ) -> Result<MatchResult> {
        if sample_files.is_empty() {
            return Err(RockitError::Input(
                "no sample files to match calibration against".to_string(),
            ));
        }

        let records = sample_files
            .par_iter()
            .map(|path| {
                self.snapshot
                    .read_metadata(path)
                    .map(|metadata| ImageRecord {
                        path: path.clone(),
                        metadata,
                    })
                    .map_err(|e| RockitError::Metadata {
                        path: path.clone(),
                        message: format!("{e:#}"),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let sample = ImageBatch::from_records(records);

        let decimals = self.profile.float_decimals;
        let mut all_keys = self.profile.ob_keys.clone();
        for key in &self.profile.dc_keys {
            if !all_keys.contains(key) {
                all_keys.push(key.clone());
            }
        }
        if let Some((key, first, second)) = conflicting_keys(&sample, &all_keys, decimals)
            .into_iter()
            .next()
        {
            return Err(RockitError::InconsistentSample {
                key,
                first: first.to_string(),
                second: second.to_string(),
            });
        }

        let all: Vec<usize> = (0..sample.len()).collect();
        let window = sample.acquisition_window(&self.profile.timestamp_key, &all);
        let reference = &sample.records[0].metadata;
        if window.is_none() {
            warn!(
                "sample files carry no '{}' timestamp; calibration folders rank by size and path only",
                self.profile.timestamp_key
            );
        }

        let ob_signature = Signature::from_metadata(reference, &self.profile.ob_keys, decimals);
        let dc_signature = Signature::from_metadata(reference, &self.profile.dc_keys, decimals);

        let (ob, ob_sel) = self.select(
            CalibrationKind::OpenBeam,
            experiment_root,
            &self.profile.ob_dirs,
            &ob_signature,
            window,
        )?;
        let (dc, dc_sel) = self.select(
            CalibrationKind::DarkCurrent,
            experiment_root,
            &self.profile.dc_dirs,
            &dc_signature,
            window,
        )?;

        Ok(MatchResult {
            ob,
            dc,
            diagnostics: MatchDiagnostics {
                sample_files: sample.len(),
                sample_window: window,
                ob: ob_sel,
                dc: dc_sel,
            },
        })
    }

    fn select(
        &self,
        kind: CalibrationKind,
        experiment_root: &Path,
        subtrees: &[PathBuf],
        signature: &Signature,
        sample_window: Option<TimeWindow>,
    ) -> Result<(CalibrationSet, Selection)> {
        info!("Retrieving {kind} ...");
        let mut folders = Vec::new();
        for subtree in subtrees {
            let root = experiment_root.join(subtree);
            if self.snapshot.exists(&root) {
                self.collect_image_dirs(&root, 0, &mut folders)?;
            } else {
                warn!("{kind} folder {} does not exist", root.display());
            }
        }
        folders.sort_by(|a, b| a.0.cmp(&b.0));
        folders.dedup_by(|a, b| a.0 == b.0);

        let decimals = self.profile.float_decimals;
        let filter = signature_filter(signature);
        let ts_key = self.profile.timestamp_key.as_str();

        let compatible: Vec<Candidate> = folders
            .par_iter()
            .filter_map(|(directory, files)| {
                let batch = ImageBatch::from_records(self.read_records(files));
                let matching = filtered_indices(&batch, &filter, decimals);
                if matching.is_empty() {
                    return None;
                }
                let gap = match (sample_window, batch.acquisition_window(ts_key, &matching)) {
                    (Some(sample), Some(folder)) => sample.gap(&folder),
                    _ => f64::INFINITY,
                };
                Some(Candidate {
                    directory: directory.clone(),
                    files: matching
                        .into_iter()
                        .map(|i| batch.records[i].path.clone())
                        .collect(),
                    gap,
                })
            })
            .collect();
        let compatible_count = compatible.len();

        let mut survivors: Vec<Candidate> = match self.profile.max_time_gap_s {
            Some(max_gap) => compatible.into_iter().filter(|c| c.gap <= max_gap).collect(),
            None => compatible,
        };
        survivors.sort_by(rank);

        info!(
            "- {kind}: {} folder(s) searched, {compatible_count} compatible, {} kept",
            folders.len(),
            survivors.len()
        );

        let mut ranked = survivors.into_iter();
        let Some(best) = ranked.next() else {
            return Err(RockitError::NoMatch {
                kind,
                root: experiment_root.to_path_buf(),
                signature: signature.to_string(),
                candidates: folders.len(),
                compatible: compatible_count,
            });
        };
        if let Some(second) = ranked.next() {
            if self.profile.strict && best.gap.total_cmp(&second.gap) == Ordering::Equal {
                return Err(RockitError::AmbiguousMatch {
                    kind,
                    first: best.directory,
                    second: second.directory,
                    gap: format_gap(best.gap),
                });
            }
        }

        info!(
            "- {kind}: {} file(s) from {} (gap {})",
            best.files.len(),
            best.directory.display(),
            format_gap(best.gap)
        );
        let selection = Selection {
            kind,
            directory: best.directory,
            files: best.files.len(),
            gap_s: best.gap.is_finite().then_some(best.gap),
            candidates: folders.len(),
            compatible: compatible_count,
        };
        Ok((
            CalibrationSet {
                kind,
                files: best.files,
            },
            selection,
        ))
    }

    /// Depth-first walk in path order collecting folders that hold images.
    fn collect_image_dirs(
        &self,
        dir: &Path,
        depth: usize,
        out: &mut Vec<(PathBuf, Vec<PathBuf>)>,
    ) -> Result<()> {
        let entries = self
            .snapshot
            .list_dir(dir)
            .map_err(|e| RockitError::Metadata {
                path: dir.to_path_buf(),
                message: format!("{e:#}"),
            })?;

        let images: Vec<PathBuf> = entries
            .iter()
            .filter(|e| !e.is_dir && is_image_file(e.name()))
            .map(|e| e.path.clone())
            .collect();
        if !images.is_empty() {
            out.push((dir.to_path_buf(), images));
        }

        if depth < self.profile.max_depth {
            for sub in entries.iter().filter(|e| e.is_dir) {
                self.collect_image_dirs(&sub.path, depth + 1, out)?;
            }
        }
        Ok(())
    }

    /// Metadata of calibration candidates; unreadable files are skipped.
    fn read_records(&self, files: &[PathBuf]) -> Vec<ImageRecord> {
        files
            .iter()
            .filter_map(|path| match self.snapshot.read_metadata(path) {
                Ok(metadata) => Some(ImageRecord {
                    path: path.clone(),
                    metadata,
                }),
                Err(e) => {
                    warn!("skipping {}: {e:#}", path.display());
                    None
                }
            })
            .collect()
    }
}

fn format_gap(gap: f64) -> String {
    if gap.is_finite() {
        format!("{gap:.1} s")
    } else {
        "no timestamp".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::{AcquisitionMetadata, MetadataValue};
    use crate::data::snapshot::MemorySnapshot;

    const ROOT: &str = "/HFIR/CG1D/IPTS-1";

    fn meta(exposure: f64, slit: f64, time: Option<f64>) -> AcquisitionMetadata {
        let mut m = AcquisitionMetadata::new();
        m.insert("ManufacturerStr".into(), MetadataValue::String("Andor".into()));
        m.insert("ModelStr".into(), MetadataValue::String("iKon-L".into()));
        m.insert("ExposureTime".into(), MetadataValue::Float(exposure));
        for key in ["MotSlitHR.RBV", "MotSlitHL.RBV", "MotSlitVT.RBV", "MotSlitVB.RBV"] {
            m.insert(key.into(), MetadataValue::Float(slit));
        }
        if let Some(t) = time {
            m.insert("TimeStamp".into(), MetadataValue::Float(t));
        }
        m
    }

    fn sample(fs: &mut MemorySnapshot, n: usize, m: &AcquisitionMetadata) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let path = PathBuf::from(format!("{ROOT}/raw/ct/s_000_{i:03}_{i:04}.tiff"));
                fs.add_file(&path, m.clone());
                path
            })
            .collect()
    }

    fn add_set(fs: &mut MemorySnapshot, dir: &str, n: usize, m: &AcquisitionMetadata) {
        for i in 0..n {
            fs.add_file(format!("{ROOT}/{dir}/img_{i:04}.tiff"), m.clone());
        }
    }

    fn run(fs: &MemorySnapshot, files: &[PathBuf]) -> Result<MatchResult> {
        run_with(fs, files, InstrumentProfile::cg1d())
    }

    fn run_with(
        fs: &MemorySnapshot,
        files: &[PathBuf],
        profile: InstrumentProfile,
    ) -> Result<MatchResult> {
        CalibrationMatcher::new(&profile, fs).match_calibration(files, Path::new(ROOT))
    }

    #[test]
    fn matched_files_share_the_sample_signature() {
        let mut fs = MemorySnapshot::new();
        let s = meta(30.0, 10.0, Some(1000.0));
        let files = sample(&mut fs, 3, &s);
        add_set(&mut fs, "raw/ob/run1", 4, &meta(30.0, 10.0, Some(900.0)));
        // same folder, other slit opening: must not leak in
        fs.add_file(
            format!("{ROOT}/raw/ob/run1/wide_0001.tiff"),
            meta(30.0, 20.0, Some(950.0)),
        );
        add_set(&mut fs, "raw/df/run1", 5, &meta(30.0, 99.0, Some(800.0)));

        let result = run(&fs, &files).unwrap();
        assert_eq!(result.ob.len(), 4);
        assert!(result
            .ob
            .files
            .iter()
            .all(|f| !f.to_string_lossy().contains("wide")));
        // slit values are not part of the DC signature
        assert_eq!(result.dc.len(), 5);

        let profile = InstrumentProfile::cg1d();
        let want = Signature::from_metadata(&s, &profile.ob_keys, 3);
        for f in &result.ob.files {
            let got = Signature::from_metadata(&fs.read_metadata(f).unwrap(), &profile.ob_keys, 3);
            assert_eq!(got, want);
        }
    }

    #[test]
    fn closest_acquisition_wins_then_size_then_path() {
        let mut fs = MemorySnapshot::new();
        let files = sample(&mut fs, 2, &meta(30.0, 10.0, Some(10_000.0)));
        add_set(&mut fs, "raw/ob/far", 10, &meta(30.0, 10.0, Some(1_000.0)));
        add_set(&mut fs, "raw/ob/near", 2, &meta(30.0, 10.0, Some(9_000.0)));
        add_set(&mut fs, "raw/df/b", 3, &meta(30.0, 0.0, None));
        add_set(&mut fs, "raw/df/a", 3, &meta(30.0, 0.0, None));
        add_set(&mut fs, "raw/df/c", 2, &meta(30.0, 0.0, None));

        let result = run(&fs, &files).unwrap();
        let d = &result.diagnostics;
        assert_eq!(d.ob.directory, PathBuf::from(format!("{ROOT}/raw/ob/near")));
        assert_eq!(d.ob.gap_s, Some(1_000.0));
        assert_eq!(d.ob.candidates, 2);
        // no timestamps: more files, then lexical path
        assert_eq!(d.dc.directory, PathBuf::from(format!("{ROOT}/raw/df/a")));
        assert_eq!(d.dc.gap_s, None);
        assert_eq!(d.dc.compatible, 3);
    }

    #[test]
    fn timestamped_folder_beats_untimed_one() {
        let mut fs = MemorySnapshot::new();
        let files = sample(&mut fs, 1, &meta(30.0, 10.0, Some(5_000.0)));
        add_set(&mut fs, "raw/ob/untimed", 20, &meta(30.0, 10.0, None));
        add_set(&mut fs, "raw/ob/timed", 1, &meta(30.0, 10.0, Some(1.0)));
        add_set(&mut fs, "raw/df/x", 1, &meta(30.0, 0.0, Some(1.0)));
        let result = run(&fs, &files).unwrap();
        assert!(result.diagnostics.ob.directory.ends_with("timed"));
    }

    #[test]
    fn repeated_matches_are_identical() {
        let mut fs = MemorySnapshot::new();
        let files = sample(&mut fs, 4, &meta(30.0, 10.0, Some(100.0)));
        for dir in ["raw/ob/a", "raw/ob/b/nested", "raw/ob/c"] {
            add_set(&mut fs, dir, 3, &meta(30.0, 10.0, Some(50.0)));
        }
        add_set(&mut fs, "raw/df/a", 3, &meta(30.0, 0.0, Some(50.0)));
        let first = run(&fs, &files).unwrap();
        for _ in 0..5 {
            assert_eq!(run(&fs, &files).unwrap(), first);
        }
        // shuffled sample order does not matter either
        let mut reversed = files.clone();
        reversed.reverse();
        assert_eq!(run(&fs, &reversed).unwrap(), first);
    }

    #[test]
    fn strict_mode_rejects_ties() {
        let mut fs = MemorySnapshot::new();
        let files = sample(&mut fs, 2, &meta(30.0, 10.0, Some(100.0)));
        add_set(&mut fs, "raw/ob/a", 3, &meta(30.0, 10.0, Some(100.0)));
        add_set(&mut fs, "raw/ob/b", 5, &meta(30.0, 10.0, Some(100.0)));
        add_set(&mut fs, "raw/df/a", 3, &meta(30.0, 0.0, Some(100.0)));

        let lenient = run(&fs, &files).unwrap();
        assert!(lenient.diagnostics.ob.directory.ends_with("b"));

        let strict = InstrumentProfile {
            strict: true,
            ..InstrumentProfile::cg1d()
        };
        let err = run_with(&fs, &files, strict).unwrap_err();
        assert!(matches!(
            err,
            RockitError::AmbiguousMatch {
                kind: CalibrationKind::OpenBeam,
                ..
            }
        ));
    }

    #[test]
    fn no_compatible_folder() {
        let mut fs = MemorySnapshot::new();
        let files = sample(&mut fs, 2, &meta(30.0, 10.0, None));
        add_set(&mut fs, "raw/ob/a", 3, &meta(60.0, 10.0, None));
        add_set(&mut fs, "raw/df/a", 3, &meta(30.0, 0.0, None));
        match run(&fs, &files).unwrap_err() {
            RockitError::NoMatch {
                kind,
                candidates,
                compatible,
                ..
            } => {
                assert_eq!(kind, CalibrationKind::OpenBeam);
                assert_eq!((candidates, compatible), (1, 0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_subtree_is_no_match() {
        let mut fs = MemorySnapshot::new();
        let files = sample(&mut fs, 1, &meta(30.0, 10.0, None));
        add_set(&mut fs, "raw/ob/a", 3, &meta(30.0, 10.0, None));
        let err = run(&fs, &files).unwrap_err();
        assert!(matches!(
            err,
            RockitError::NoMatch {
                kind: CalibrationKind::DarkCurrent,
                candidates: 0,
                ..
            }
        ));
    }

    #[test]
    fn sample_disagreeing_on_exposure() {
        let mut fs = MemorySnapshot::new();
        let mut files = sample(&mut fs, 2, &meta(30.0, 10.0, None));
        let odd = PathBuf::from(format!("{ROOT}/raw/ct/s_090_000_0099.tiff"));
        fs.add_file(&odd, meta(45.0, 10.0, None));
        files.push(odd);
        let err = run(&fs, &files).unwrap_err();
        match err {
            RockitError::InconsistentSample { key, .. } => assert_eq!(key, "ExposureTime"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn max_gap_drops_stale_folders() {
        let mut fs = MemorySnapshot::new();
        let files = sample(&mut fs, 1, &meta(30.0, 10.0, Some(100_000.0)));
        add_set(&mut fs, "raw/ob/old", 3, &meta(30.0, 10.0, Some(1.0)));
        add_set(&mut fs, "raw/df/a", 3, &meta(30.0, 0.0, Some(99_000.0)));
        let profile = InstrumentProfile {
            max_time_gap_s: Some(3600.0),
            ..InstrumentProfile::cg1d()
        };
        let err = run_with(&fs, &files, profile).unwrap_err();
        assert!(matches!(
            err,
            RockitError::NoMatch {
                kind: CalibrationKind::OpenBeam,
                compatible: 1,
                ..
            }
        ));
    }

    #[test]
    fn search_depth_is_bounded() {
        let mut fs = MemorySnapshot::new();
        let files = sample(&mut fs, 1, &meta(30.0, 10.0, None));
        add_set(&mut fs, "raw/ob/a/b/c/d", 3, &meta(30.0, 10.0, None));
        add_set(&mut fs, "raw/df/a", 3, &meta(30.0, 0.0, None));
        let shallow = InstrumentProfile {
            max_depth: 2,
            ..InstrumentProfile::cg1d()
        };
        assert!(run_with(&fs, &files, shallow).is_err());
        let deep = InstrumentProfile {
            max_depth: 4,
            ..InstrumentProfile::cg1d()
        };
        assert_eq!(run_with(&fs, &files, deep).unwrap().ob.len(), 3);
    }

    #[test]
    fn unreadable_sample_metadata() {
        let fs = MemorySnapshot::new();
        let err = run(&fs, &[PathBuf::from(format!("{ROOT}/raw/ct/x.tiff"))]).unwrap_err();
        assert!(matches!(err, RockitError::Metadata { .. }));
    }
}
