//! Virtual-to-physical path translation.
//!
//! Scripts see a virtual filesystem: optionally chrooted at a configured root,
//! with additional mount points grafted in. I/O code needs physical paths.
//! [`PathTranslator`] converts in both directions, lexically — no filesystem
//! access, so nonexistent paths translate the same as existing ones.
//!
//! Mounts take precedence over the root on both directions, longest virtual
//! prefix first. Without a root, virtual and physical space coincide.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Translates script-visible paths to physical paths and back.
#[derive(Debug, Clone, Default)]
pub struct PathTranslator {
    /// Physical directory acting as the virtual filesystem root.
    root: Option<PathBuf>,
    /// Current virtual working directory (always absolute).
    working_dir: String,
    /// Virtual prefix -> physical directory, kept sorted longest-prefix-first.
    mounts: Vec<(String, PathBuf)>,
}

impl PathTranslator {
    /// Creates a translator with no root: virtual space is physical space.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: None,
            working_dir: "/".to_string(),
            mounts: Vec::new(),
        }
    }

    /// Sets the physical root directory for the virtual filesystem.
    pub fn set_root(&mut self, root: impl Into<PathBuf>) {
        self.root = Some(root.into());
    }

    /// Returns the configured root, if any.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Sets the virtual working directory used to resolve relative paths.
    ///
    /// A relative argument resolves against the current working directory.
    pub fn set_working_dir(&mut self, dir: &str) -> io::Result<()> {
        let absolute = if dir.starts_with('/') {
            normalize(dir)?
        } else {
            normalize(&join_virtual(&self.working_dir, dir))?
        };
        self.working_dir = absolute;
        Ok(())
    }

    /// Returns the current virtual working directory.
    #[must_use]
    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    /// Grafts a physical directory into the virtual tree at `prefix`.
    pub fn mount(&mut self, prefix: &str, physical: impl Into<PathBuf>) {
        self.mounts.push((trim_trailing(prefix), physical.into()));
        // Longest prefix must win on lookup.
        self.mounts.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Maps a virtual path to the physical path I/O should use.
    ///
    /// # Errors
    ///
    /// Fails when the path climbs above the virtual root.
    pub fn translate(&self, virtual_path: &str) -> io::Result<PathBuf> {
        let absolute = if virtual_path.starts_with('/') {
            normalize(virtual_path)?
        } else {
            normalize(&join_virtual(&self.working_dir, virtual_path))?
        };

        for (prefix, physical) in &self.mounts {
            if let Some(rest) = strip_virtual_prefix(&absolute, prefix) {
                return Ok(append_virtual(physical.clone(), rest));
            }
        }

        match &self.root {
            Some(root) => Ok(append_virtual(root.clone(), absolute.trim_start_matches('/'))),
            None => Ok(PathBuf::from(absolute)),
        }
    }

    /// Maps a physical path back to the virtual path scripts should see.
    ///
    /// # Errors
    ///
    /// Fails when the physical path lies outside the root and every mount.
    pub fn reverse_translate(&self, physical: &Path) -> io::Result<String> {
        for (prefix, mount_physical) in &self.mounts {
            if let Ok(rest) = physical.strip_prefix(mount_physical) {
                return Ok(join_components(prefix, rest));
            }
        }

        match &self.root {
            Some(root) => match physical.strip_prefix(root) {
                Ok(rest) => Ok(join_components("", rest)),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path {} is outside the filesystem root", physical.display()),
                )),
            },
            None => Ok(physical.to_string_lossy().into_owned()),
        }
    }
}

/// Joins a relative virtual path onto an absolute one.
fn join_virtual(base: &str, rel: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{rel}")
    } else {
        format!("{base}/{rel}")
    }
}

/// Lexically normalizes an absolute virtual path, resolving `.` and `..`.
fn normalize(path: &str) -> io::Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("path {path} escapes the filesystem root"),
                    ));
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

fn trim_trailing(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Returns the remainder of `path` under `prefix`, without a leading slash.
fn strip_virtual_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if path == prefix {
        return Some("");
    }
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// Appends virtual remainder segments onto a physical base.
fn append_virtual(mut base: PathBuf, rest: &str) -> PathBuf {
    for seg in rest.split('/').filter(|s| !s.is_empty()) {
        base.push(seg);
    }
    base
}

/// Builds a virtual path from a prefix and physical remainder components.
fn join_components(prefix: &str, rest: &Path) -> String {
    let mut out = String::from(prefix);
    for comp in rest.components() {
        if let Component::Normal(seg) = comp {
            out.push('/');
            out.push_str(&seg.to_string_lossy());
        }
    }
    if out.is_empty() {
        "/".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rooted() -> PathTranslator {
        let mut t = PathTranslator::new();
        t.set_root("/srv/jail");
        t
    }

    #[test]
    fn no_root_is_identity() {
        let t = PathTranslator::new();
        assert_eq!(t.translate("/etc/hosts").unwrap(), PathBuf::from("/etc/hosts"));
        assert_eq!(
            t.reverse_translate(Path::new("/etc/hosts")).unwrap(),
            "/etc/hosts"
        );
    }

    #[test]
    fn root_prefixes_physical_paths() {
        let t = rooted();
        assert_eq!(
            t.translate("/app/index.js").unwrap(),
            PathBuf::from("/srv/jail/app/index.js")
        );
        assert_eq!(t.translate("/").unwrap(), PathBuf::from("/srv/jail"));
    }

    #[test]
    fn relative_paths_resolve_against_working_dir() {
        let mut t = rooted();
        t.set_working_dir("/app").unwrap();
        assert_eq!(
            t.translate("lib/util.js").unwrap(),
            PathBuf::from("/srv/jail/app/lib/util.js")
        );
        t.set_working_dir("lib").unwrap();
        assert_eq!(t.working_dir(), "/app/lib");
    }

    #[test]
    fn dotdot_inside_root_is_fine_but_escape_is_not() {
        let t = rooted();
        assert_eq!(
            t.translate("/a/b/../c").unwrap(),
            PathBuf::from("/srv/jail/a/c")
        );
        assert!(t.translate("/../up").is_err());
        assert!(t.translate("/a/../../up").is_err());
    }

    #[test]
    fn mounts_override_root() {
        let mut t = rooted();
        t.mount("/tmp", "/var/scratch");
        assert_eq!(
            t.translate("/tmp/x.log").unwrap(),
            PathBuf::from("/var/scratch/x.log")
        );
        assert_eq!(
            t.reverse_translate(Path::new("/var/scratch/x.log")).unwrap(),
            "/tmp/x.log"
        );
        // Non-mount traffic still goes through the root.
        assert_eq!(
            t.translate("/tmpfile").unwrap(),
            PathBuf::from("/srv/jail/tmpfile")
        );
    }

    #[test]
    fn longest_mount_prefix_wins() {
        let mut t = rooted();
        t.mount("/data", "/mnt/a");
        t.mount("/data/hot", "/mnt/fast");
        assert_eq!(
            t.translate("/data/hot/f").unwrap(),
            PathBuf::from("/mnt/fast/f")
        );
        assert_eq!(t.translate("/data/cold/f").unwrap(), PathBuf::from("/mnt/a/cold/f"));
    }

    #[test]
    fn reverse_rejects_paths_outside_root() {
        let t = rooted();
        assert!(t.reverse_translate(Path::new("/etc/passwd")).is_err());
        assert_eq!(
            t.reverse_translate(Path::new("/srv/jail/app/x")).unwrap(),
            "/app/x"
        );
    }

    fn virtual_path() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z][a-z0-9]{0,7}", 0..5)
            .prop_map(|segs| format!("/{}", segs.join("/")))
    }

    proptest! {
        #[test]
        fn round_trip_inside_root(p in virtual_path()) {
            let t = rooted();
            let physical = t.translate(&p).unwrap();
            prop_assert_eq!(t.reverse_translate(&physical).unwrap(), p);
        }

        #[test]
        fn round_trip_inside_mount(p in virtual_path()) {
            let mut t = rooted();
            t.mount("/m", "/elsewhere/data");
            let virt = format!("/m{}", if p == "/" { String::new() } else { p.clone() });
            let physical = t.translate(&virt).unwrap();
            prop_assert_eq!(t.reverse_translate(&physical).unwrap(), virt);
        }
    }
}
