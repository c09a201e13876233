//
// snapshot.rs -- crash-tolerance snapshot arbitration
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::header::Header;

/// Outcome of comparing two crash-tolerance snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSelection {
    /// Restore from this snapshot.
    Latest(PathBuf),
    /// Both snapshots are equally recent.
    Same,
    /// Sync counters are more than one step apart; the snapshot pair
    /// was not maintained in lockstep and deserves manual inspection.
    Suspicious,
    /// Neither snapshot is a readable numsync database.
    Bad,
}

fn probe(path: &Path) -> Option<(u32, SystemTime)> {
    let metadata = std::fs::metadata(path).ok()?;
    let mut file = File::open(path).ok()?;
    let header = Header::from_reader(metadata.len(), &mut file).ok()?;

    // only numsync databases carry an ordering counter
    let counter = header.numsync?;
    let mtime = metadata.modified().ok()?;

    Some((counter, mtime))
}

/// Pick the snapshot to restore after a crash.
///
/// A crash-tolerance layer maintains two snapshot copies of a numsync
/// database, alternating between them on every sync.  The one with the
/// higher sync counter is the freshest; ties fall back to modification
/// time.  Counters more than one step apart mean the pair was not kept
/// in lockstep.
pub fn latest_snapshot<P: AsRef<Path>, Q: AsRef<Path>>(even: P, odd: Q) -> SnapshotSelection {
    let even = even.as_ref();
    let odd = odd.as_ref();

    match (probe(even), probe(odd)) {
        (None, None) => SnapshotSelection::Bad,
        (Some(_), None) => SnapshotSelection::Latest(even.to_path_buf()),
        (None, Some(_)) => SnapshotSelection::Latest(odd.to_path_buf()),
        (Some((ne, te)), Some((no, to))) => {
            if ne.abs_diff(no) > 1 {
                SnapshotSelection::Suspicious
            } else if ne > no {
                SnapshotSelection::Latest(even.to_path_buf())
            } else if no > ne {
                SnapshotSelection::Latest(odd.to_path_buf())
            } else if te > to {
                SnapshotSelection::Latest(even.to_path_buf())
            } else if to > te {
                SnapshotSelection::Latest(odd.to_path_buf())
            } else {
                SnapshotSelection::Same
            }
        }
    }
}
