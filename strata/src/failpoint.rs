//! Named fault-injection points for tests.
//!
//! A failpoint is armed per thread, so concurrent tests cannot trip each
//! other. The `STRATA_FAILPOINTS` environment variable (a comma-separated
//! list of names) arms points process-wide for whole-binary runs; it is
//! read once, on first use.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::sync::OnceLock;

thread_local! {
    static ARMED: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

fn armed_by_env() -> &'static HashSet<String> {
    static FROM_ENV: OnceLock<HashSet<String>> = OnceLock::new();
    FROM_ENV.get_or_init(|| {
        let Ok(raw) = std::env::var("STRATA_FAILPOINTS") else {
            return HashSet::new();
        };
        raw.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    })
}

/// Arms `name` for the current thread until the returned guard drops.
#[must_use = "the failpoint disarms when the guard is dropped"]
pub fn arm(name: &str) -> Armed {
    ARMED.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
    Armed {
        name: name.to_string(),
    }
}

pub struct Armed {
    name: String,
}

impl Drop for Armed {
    fn drop(&mut self) {
        ARMED.with(|set| {
            set.borrow_mut().remove(&self.name);
        });
    }
}

pub fn is_armed(name: &str) -> bool {
    ARMED.with(|set| set.borrow().contains(name)) || armed_by_env().contains(name)
}

/// Returns an I/O error if `name` is armed; call sites thread it through
/// with `?` like any real failure.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    if !is_armed(name) {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("injected fault at {name}"),
    ))
}
