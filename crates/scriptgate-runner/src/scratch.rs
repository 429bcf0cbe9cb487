//! Per-run scratch directory

use crate::bindings::ExecutionBindings;
use crate::error::RunnerError;
use crate::isolation::SandboxIdentity;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary working directory holding the script and its inputs
///
/// Removed on drop. Permissions are restored first so a read-only tree can
/// still be deleted.
#[derive(Debug)]
pub(crate) struct Scratch {
    dir: TempDir,
    script: PathBuf,
    read_only: bool,
}

impl Scratch {
    /// Create scratch under `root` and populate it
    ///
    /// With `read_only`, the tree is made unwritable once populated.
    /// Otherwise, when an `owner` is given, it is handed to that identity.
    pub(crate) fn prepare(
        root: Option<&Path>,
        script_name: &str,
        source: &str,
        bindings: &ExecutionBindings,
        read_only: bool,
        owner: Option<SandboxIdentity>,
    ) -> Result<Self, RunnerError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("scriptgate-");
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| RunnerError::io("create scratch root", &e))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| RunnerError::io("create scratch", &e))?;

        let script = dir.path().join(script_name);
        std::fs::write(&script, source).map_err(|e| RunnerError::io("write script", &e))?;
        bindings.write_files(dir.path())?;

        let scratch = Self {
            dir,
            script,
            read_only,
        };
        if read_only {
            set_tree_mode(scratch.path(), 0o555, 0o444)?;
        } else if let Some(owner) = owner {
            chown_tree(scratch.path(), owner)?;
        }
        Ok(scratch)
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn script(&self) -> &Path {
        &self.script
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if self.read_only {
            if let Err(e) = set_tree_mode(self.dir.path(), 0o700, 0o600) {
                tracing::warn!(path = %self.dir.path().display(), error = %e, "could not unlock scratch for removal");
            }
        }
    }
}

fn walk(root: &Path, visit: &mut dyn FnMut(&Path, bool) -> Result<(), RunnerError>) -> Result<(), RunnerError> {
    let entries = std::fs::read_dir(root).map_err(|e| RunnerError::io("read scratch", &e))?;
    for entry in entries {
        let entry = entry.map_err(|e| RunnerError::io("read scratch", &e))?;
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .map_err(|e| RunnerError::io("stat scratch entry", &e))?
            .is_dir();
        if is_dir {
            walk(&path, visit)?;
        } else {
            visit(&path, false)?;
        }
    }
    visit(root, true)
}

fn set_tree_mode(root: &Path, dir_mode: u32, file_mode: u32) -> Result<(), RunnerError> {
    walk(root, &mut |path, is_dir| {
        let mode = if is_dir { dir_mode } else { file_mode };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| RunnerError::io("set scratch permissions", &e))
    })
}

fn chown_tree(root: &Path, owner: SandboxIdentity) -> Result<(), RunnerError> {
    let uid = nix::unistd::Uid::from_raw(owner.uid);
    let gid = nix::unistd::Gid::from_raw(owner.gid);
    walk(root, &mut |path, _| {
        nix::unistd::chown(path, Some(uid), Some(gid))
            .map_err(|e| RunnerError::Io(format!("chown scratch: {e}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populated_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let bindings = ExecutionBindings::new().with_file("in/data.txt", "42");
        let path = {
            let scratch =
                Scratch::prepare(Some(root.path()), "main.py", "print(1)\n", &bindings, false, None).unwrap();
            assert_eq!(std::fs::read_to_string(scratch.script()).unwrap(), "print(1)\n");
            assert!(scratch.path().join("in/data.txt").exists());
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn read_only_tree_is_still_removed() {
        let bindings = ExecutionBindings::new().with_file("nested/x.txt", "x");
        let scratch = Scratch::prepare(None, "main.py", "pass\n", &bindings, true, None).unwrap();
        let mode = std::fs::metadata(scratch.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
        let path = scratch.path().to_path_buf();
        drop(scratch);
        assert!(!path.exists());
    }
}
