//! Temporary git repositories for merge and orchestration tests.

use std::path::Path;

use tempfile::TempDir;

use armada::git::GitRunner;

pub struct TestRepo {
    pub root: TempDir,
    pub git: GitRunner,
}

impl TestRepo {
    /// Fresh repo on `main` with one initial commit.
    pub async fn init() -> Self {
        let root = TempDir::new().expect("Failed to create temp dir");
        let git = GitRunner::new(root.path());

        git.run_checked(&["init", "-b", "main"]).await.unwrap();
        git.run_checked(&["config", "user.email", "armada@test.local"])
            .await
            .unwrap();
        git.run_checked(&["config", "user.name", "Armada Test"])
            .await
            .unwrap();

        tokio::fs::write(root.path().join("README.md"), "# test repo\n")
            .await
            .unwrap();
        git.run_checked(&["add", "-A"]).await.unwrap();
        git.run_checked(&["commit", "-m", "initial commit"])
            .await
            .unwrap();

        Self { root, git }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Commit a file on the currently checked-out branch.
    pub async fn commit_file(&self, path: &str, content: &str, message: &str) {
        let full = self.root.path().join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&full, content).await.unwrap();
        self.git.run_checked(&["add", "-A"]).await.unwrap();
        self.git
            .run_checked(&["commit", "-m", message])
            .await
            .unwrap();
    }

    /// Create `branch` from main with a single file commit, then return to
    /// main.
    pub async fn branch_with_commit(&self, branch: &str, path: &str, content: &str) {
        self.git
            .run_checked(&["checkout", "-b", branch, "main"])
            .await
            .unwrap();
        self.commit_file(path, content, &format!("work on {}", branch))
            .await;
        self.git.run_checked(&["checkout", "main"]).await.unwrap();
    }

    /// Point `branch` at a fresh commit off main, discarding its history.
    /// Stands in for a conflict-fix worker rewriting the branch.
    pub async fn rewrite_branch(&self, branch: &str, path: &str, content: &str) {
        let scratch = format!("{}-rewrite", branch.replace('/', "-"));
        self.git
            .run_checked(&["checkout", "-b", &scratch, "main"])
            .await
            .unwrap();
        self.commit_file(path, content, &format!("rewrite {}", branch))
            .await;
        self.git.run_checked(&["checkout", "main"]).await.unwrap();
        self.git
            .run_checked(&["branch", "-f", branch, &scratch])
            .await
            .unwrap();
        self.git
            .run_checked(&["branch", "-D", &scratch])
            .await
            .unwrap();
    }
}
