//! Named failpoints for crash simulation
//!
//! Tests arm a failpoint on their own thread; `HASHDBM_FAILPOINTS`
//! (comma separated) arms points for the whole process and is read once.
//! When the engine reaches an armed point the surrounding I/O fails as if
//! the disk had refused it, or the process had died there.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::sync::OnceLock;

/// Snapshot body is on disk but the state marker has not been flipped
pub const SNAPSHOT_BEFORE_FLIP: &str = "snapshot.before_flip";

/// Snapshot committed, header not yet rewritten in the database file
pub const COMMIT_BEFORE_HEADER: &str = "commit.before_header";

/// Rebuilt file is complete but has not replaced the original
pub const REBUILD_BEFORE_RENAME: &str = "rebuild.before_rename";

/// The database file is about to grow
pub const FILE_GROW: &str = "file.grow";

const ENV_VAR: &str = "HASHDBM_FAILPOINTS";

thread_local! {
    static ARMED: RefCell<HashSet<&'static str>> = RefCell::new(HashSet::new());
}

fn from_env() -> &'static HashSet<String> {
    static NAMES: OnceLock<HashSet<String>> = OnceLock::new();
    NAMES.get_or_init(|| {
        std::env::var(ENV_VAR)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    })
}

/// Arm `name` on the current thread
pub fn enable(name: &'static str) {
    ARMED.with(|armed| {
        armed.borrow_mut().insert(name);
    });
}

/// Disarm every failpoint of the current thread
pub fn clear() {
    ARMED.with(|armed| armed.borrow_mut().clear());
}

/// Fail if `name` is armed
pub(crate) fn check(name: &str) -> io::Result<()> {
    let armed = ARMED.with(|armed| armed.borrow().contains(name)) || from_env().contains(name);
    if armed {
        Err(io::Error::other(format!("failpoint {} reached", name)))
    } else {
        Ok(())
    }
}
