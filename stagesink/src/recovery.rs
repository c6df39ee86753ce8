//! Decides, per pre-existing stage file, whether a (re)assigned partition
//! should reprocess or preserve it.
//!
//! The stage listing is the ground truth across restarts; nothing is
//! journaled locally. Files whose offsets the upstream log will deliver
//! again are redundant and get purged after a delay; the remainder is
//! presumed in flight on the ingestion service and handed to the
//! reconciliation loop.

use data_types::file_name;
use observability_deps::tracing::warn;

/// The two halves of a recovered stage listing.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct StageSplit {
    /// Files whose content the upstream will re-deliver; scheduled for
    /// delayed purge.
    pub(crate) reprocess: Vec<String>,
    /// Files to reconcile through the cleaner.
    pub(crate) preserve: Vec<String>,
}

/// Partition a stage listing around the offset of the first record seen
/// after (re)assignment.
///
/// Iterates a snapshot of the listing; membership of each name in exactly
/// one half is the observable contract.
pub(crate) fn split_reprocess_files(
    files_on_stage: Vec<String>,
    first_record_offset: i64,
) -> StageSplit {
    let mut split = StageSplit::default();
    for name in files_on_stage {
        match file_name::start_offset(&name) {
            Ok(start) if start >= first_record_offset => split.reprocess.push(name),
            Ok(_) => split.preserve.push(name),
            Err(e) => {
                // an unparseable name cannot be matched against the
                // incoming stream; let the cleaner age it out
                warn!(file_name = %name, e = %e, "undecodable file on stage, preserving");
                split.preserve.push(name);
            }
        }
    }
    split
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn splits_around_the_first_record_offset() {
        let listed = names(&[
            "p/20_29_1.json.gz",
            "p/30_39_2.json.gz",
            "p/40_49_3.json.gz",
        ]);
        let split = split_reprocess_files(listed, 30);

        assert_eq!(
            split.preserve,
            names(&["p/20_29_1.json.gz"]),
            "files below the replay point stay in flight"
        );
        assert_eq!(
            split.reprocess,
            names(&["p/30_39_2.json.gz", "p/40_49_3.json.gz"])
        );
    }

    #[test]
    fn empty_listing_splits_empty() {
        assert_eq!(split_reprocess_files(vec![], 0), StageSplit::default());
    }

    #[test]
    fn boundary_file_is_reprocessed() {
        // start offset equal to the first record offset will be
        // re-delivered, so the staged copy is redundant
        let split = split_reprocess_files(names(&["p/30_39_2.json.gz"]), 30);
        assert!(split.preserve.is_empty());
        assert_eq!(split.reprocess.len(), 1);
    }

    #[test]
    fn undecodable_names_are_preserved() {
        let split = split_reprocess_files(names(&["p/garbage"]), 0);
        assert_eq!(split.preserve, names(&["p/garbage"]));
        assert!(split.reprocess.is_empty());
    }
}
