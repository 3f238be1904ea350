//! Running code inside another network namespace

use std::fs::File;
use std::io;
use std::path::Path;
use std::thread;

use nix::sched::setns;
use nix::sched::CloneFlags;

/// Network namespace of the calling thread
pub const CURRENT_NETNS: &str = "/proc/thread-self/ns/net";

/// Runs `f` on a fresh thread that has entered the network namespace at `path`.
///
/// The namespace is fixed per thread, so the caller's threads never change
/// namespace. `NotFound` is returned when the namespace file does not exist.
pub fn with_netns<T, F>(path: &Path, f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send,
    T: Send,
{
    let target = File::open(path)?;

    thread::scope(|scope| {
        scope
            .spawn(move || {
                setns(&target, CloneFlags::CLONE_NEWNET).map_err(io::Error::from)?;
                f()
            })
            .join()
            .map_err(|_| io::Error::other("network namespace worker panicked"))?
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_namespace_is_not_found() {
        let error = with_netns(Path::new("/nonexistent/netns"), || Ok(()))
            .expect_err("missing namespace should fail");
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }
}
