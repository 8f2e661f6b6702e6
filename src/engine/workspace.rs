use std::{
    collections::HashSet,
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
};

use bytes::Bytes;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::engine::{config::WorkspaceConfig, error::WorkspaceError};

#[derive(Debug, Clone)]
pub struct StagedFile {
    pub name: String,
    pub content: Bytes,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    cfg: WorkspaceConfig,
}

impl WorkspaceManager {
    pub fn new(cfg: WorkspaceConfig) -> Self {
        Self { cfg }
    }

    pub fn base_dir(&self) -> &Path {
        &self.cfg.base_dir
    }

    /// Creates the base directory and removes anything left behind by a
    /// previous process. The base directory is owned by this service alone.
    pub async fn init(&self) -> Result<usize, WorkspaceError> {
        let base = &self.cfg.base_dir;
        fs::create_dir_all(base)
            .await
            .map_err(|e| WorkspaceError::io(base, e))?;

        let mut entries = fs::read_dir(base)
            .await
            .map_err(|e| WorkspaceError::io(base, e))?;
        let mut purged = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::io(base, e))?
        {
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => remove_tree(&path).await,
                _ => fs::remove_file(&path).await,
            };
            match result {
                Ok(()) => purged += 1,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to purge stale workspace entry");
                }
            }
        }
        Ok(purged)
    }

    pub async fn create(&self, job_id: Uuid) -> Result<Workspace, WorkspaceError> {
        let root = self.cfg.base_dir.join(job_id.as_simple().to_string());
        let input_root = root.join("input");
        let output_root = root.join("output");

        let mut builder = fs::DirBuilder::new();
        builder.mode(self.cfg.dir_mode);
        // Non-recursive: an existing directory means the id was reused.
        builder
            .create(&root)
            .await
            .map_err(|e| WorkspaceError::io(&root, e))?;

        let workspace = Workspace {
            job_id,
            root,
            input_root,
            output_root,
            staged: Vec::new(),
            reclaimed: false,
        };
        for dir in [&workspace.input_root, &workspace.output_root] {
            builder
                .create(dir)
                .await
                .map_err(|e| WorkspaceError::io(dir, e))?;
        }
        Ok(workspace)
    }

    pub async fn stage(
        &self,
        workspace: &mut Workspace,
        files: &[StagedFile],
    ) -> Result<(), WorkspaceError> {
        let relative = validate_sources(files, &self.cfg)?;

        let mut builder = fs::DirBuilder::new();
        builder.mode(self.cfg.dir_mode).recursive(true);

        for (file, rel) in files.iter().zip(relative) {
            let target = workspace.input_root.join(&rel);
            if let Some(parent) = target.parent()
                && parent != workspace.input_root
            {
                builder
                    .create(parent)
                    .await
                    .map_err(|e| WorkspaceError::io(parent, e))?;
            }
            let mut handle = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o660)
                .open(&target)
                .await
                .map_err(|e| WorkspaceError::io(&target, e))?;
            handle
                .write_all(&file.content)
                .await
                .map_err(|e| WorkspaceError::io(&target, e))?;
            handle
                .flush()
                .await
                .map_err(|e| WorkspaceError::io(&target, e))?;
            workspace.staged.push(file.name.clone());
        }
        Ok(())
    }
}

/// Checks names and size caps for a whole submission before anything touches
/// the disk. Returns the normalized relative path of every file, in order.
pub fn validate_sources(
    files: &[StagedFile],
    cfg: &WorkspaceConfig,
) -> Result<Vec<PathBuf>, WorkspaceError> {
    if files.is_empty() {
        return Err(WorkspaceError::NoFiles);
    }
    if files.len() > cfg.max_files {
        return Err(WorkspaceError::TooManyFiles {
            count: files.len(),
            max: cfg.max_files,
        });
    }

    let mut seen = HashSet::with_capacity(files.len());
    let mut relative = Vec::with_capacity(files.len());
    let mut total: u64 = 0;
    for file in files {
        let rel = plain_relative_path(&file.name)
            .ok_or_else(|| WorkspaceError::InvalidFileName(file.name.clone()))?;
        if !seen.insert(rel.clone()) {
            return Err(WorkspaceError::DuplicateFile(file.name.clone()));
        }

        let size = file.content.len() as u64;
        if size > cfg.max_file_bytes {
            return Err(WorkspaceError::FileTooLarge {
                name: file.name.clone(),
                size,
                max: cfg.max_file_bytes,
            });
        }
        total = total.saturating_add(size);
        if total > cfg.max_total_bytes {
            return Err(WorkspaceError::TotalTooLarge {
                size: total,
                max: cfg.max_total_bytes,
            });
        }
        relative.push(rel);
    }

    // `a` and `a/b` cannot both exist on disk.
    for rel in &relative {
        if let Some(dir) = rel.ancestors().skip(1).find(|dir| seen.contains(*dir)) {
            return Err(WorkspaceError::PathConflict(dir.display().to_string()));
        }
    }
    Ok(relative)
}

fn plain_relative_path(name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.contains('\0') {
        return None;
    }
    let path = Path::new(name);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[derive(Debug)]
pub struct Workspace {
    job_id: Uuid,
    root: PathBuf,
    input_root: PathBuf,
    output_root: PathBuf,
    staged: Vec<String>,
    reclaimed: bool,
}

impl Workspace {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_root(&self) -> &Path {
        &self.input_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn staged_files(&self) -> &[String] {
        &self.staged
    }

    /// Removes both roots. Safe to call any number of times.
    pub async fn reclaim(&mut self) -> Result<(), WorkspaceError> {
        remove_tree(&self.root)
            .await
            .map_err(|e| WorkspaceError::io(&self.root, e))?;
        self.reclaimed = true;
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.reclaimed {
            return;
        }
        if let Err(err) = remove_tree_blocking(&self.root) {
            tracing::warn!(
                job_id = %self.job_id,
                path = %self.root.display(),
                error = %err,
                "workspace dropped without reclaim and could not be removed"
            );
        }
    }
}

async fn remove_tree(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || remove_tree_blocking(&path))
                .await
                .map_err(std::io::Error::other)?
        }
        Err(err) => Err(err),
    }
}

// Submissions can chmod their own directories; restore owner access before
// the second attempt.
fn remove_tree_blocking(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => return Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(_) => {}
    }
    relax_permissions(path);
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn relax_permissions(path: &Path) {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            relax_permissions(&entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use uuid::Uuid;

    use super::{StagedFile, WorkspaceManager, validate_sources};
    use crate::engine::{config::WorkspaceConfig, error::WorkspaceError};

    fn small_caps(base: &std::path::Path) -> WorkspaceConfig {
        WorkspaceConfig {
            base_dir: base.to_path_buf(),
            max_files: 4,
            max_file_bytes: 64,
            max_total_bytes: 100,
            ..WorkspaceConfig::default()
        }
    }

    fn manager(base: &std::path::Path) -> WorkspaceManager {
        WorkspaceManager::new(small_caps(base))
    }

    fn file(name: &str, content: &str) -> StagedFile {
        StagedFile {
            name: name.to_string(),
            content: Bytes::from(content.to_string()),
        }
    }

    #[tokio::test]
    async fn creates_stages_and_reclaims() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());
        let mut ws = manager.create(Uuid::new_v4()).await.unwrap();
        assert!(ws.input_root().is_dir());
        assert!(ws.output_root().is_dir());

        manager
            .stage(&mut ws, &[file("main.py", "print(1)"), file("lib/util.py", "x = 1")])
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.input_root().join("lib/util.py")).unwrap(),
            "x = 1"
        );
        assert_eq!(ws.staged_files(), ["main.py", "lib/util.py"]);

        let root = ws.root().to_path_buf();
        ws.reclaim().await.unwrap();
        assert!(!root.exists());
        ws.reclaim().await.unwrap();
        assert!(!root.exists());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn reclaims_trees_the_submission_locked_down() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());
        let mut ws = manager.create(Uuid::new_v4()).await.unwrap();
        let locked = ws.input_root().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::write(locked.join("f"), b"x").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o500)).unwrap();

        ws.reclaim().await.unwrap();
        assert!(!ws.root().exists());
    }

    #[tokio::test]
    async fn dropping_an_unreclaimed_workspace_removes_it() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());
        let ws = manager.create(Uuid::new_v4()).await.unwrap();
        let root = ws.root().to_path_buf();
        drop(ws);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn refuses_to_reuse_a_job_id() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());
        let id = Uuid::new_v4();
        let _first = manager.create(id).await.unwrap();
        assert!(matches!(
            manager.create(id).await,
            Err(WorkspaceError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn rejected_staging_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());
        let mut ws = manager.create(Uuid::new_v4()).await.unwrap();
        let err = manager
            .stage(&mut ws, &[file("ok.txt", "fine"), file("../escape.txt", "nope")])
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidFileName(_)));
        assert_eq!(std::fs::read_dir(ws.input_root()).unwrap().count(), 0);
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn rejects_a_file_that_is_also_a_directory() {
        let cfg = WorkspaceConfig::default();
        for files in [
            [file("main.sh", "echo"), file("main.sh/x", "echo")],
            [file("lib/a/b.py", ""), file("lib/a", "")],
        ] {
            assert!(matches!(
                validate_sources(&files, &cfg),
                Err(WorkspaceError::PathConflict(_))
            ));
        }
        assert!(validate_sources(&[file("main.sh", ""), file("main.shx/y", "")], &cfg).is_ok());
    }

    #[test]
    fn rejects_paths_that_escape_the_root() {
        let cfg = WorkspaceConfig::default();
        for name in ["", "/etc/passwd", "../x", "a/../../b", "./main.py", "a/..", "nul\0byte"] {
            let result = validate_sources(&[file(name, "x")], &cfg);
            assert!(
                matches!(result, Err(WorkspaceError::InvalidFileName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn enforces_caps_and_uniqueness() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = small_caps(tmp.path());

        assert!(matches!(validate_sources(&[], &cfg), Err(WorkspaceError::NoFiles)));
        assert!(matches!(
            validate_sources(&[file("a", "1"), file("a", "2")], &cfg),
            Err(WorkspaceError::DuplicateFile(_))
        ));
        assert!(matches!(
            validate_sources(&[file("big", &"x".repeat(65))], &cfg),
            Err(WorkspaceError::FileTooLarge { .. })
        ));
        let parts: Vec<_> = (0..2)
            .map(|i| file(&format!("f{i}"), &"x".repeat(60)))
            .collect();
        assert!(matches!(
            validate_sources(&parts, &cfg),
            Err(WorkspaceError::TotalTooLarge { .. })
        ));
        let many: Vec<_> = (0..5).map(|i| file(&format!("f{i}"), "x")).collect();
        assert!(matches!(
            validate_sources(&many, &cfg),
            Err(WorkspaceError::TooManyFiles { count: 5, max: 4 })
        ));
    }

    #[tokio::test]
    async fn init_purges_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("jobs");
        std::fs::create_dir_all(base.join("stale/input")).unwrap();
        std::fs::write(base.join("stray-file"), b"x").unwrap();
        let manager = WorkspaceManager::new(WorkspaceConfig {
            base_dir: base.clone(),
            ..WorkspaceConfig::default()
        });
        assert_eq!(manager.init().await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(&base).unwrap().count(), 0);
    }
}
