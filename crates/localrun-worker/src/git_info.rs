// Repository facts read straight from the `.git` directory: the remote slug,
// the checked-out ref and the HEAD revision.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use regex::Regex;

/// A located git directory.
#[derive(Debug, Clone)]
pub struct GitRepo {
    git_dir: PathBuf,
}

impl GitRepo {
    /// Find the repository containing `start`, walking up to the root.
    pub fn discover(start: &Path) -> Result<Self> {
        let mut current = Some(start);
        while let Some(dir) = current {
            let dot_git = dir.join(".git");
            if dot_git.is_dir() {
                return Ok(Self { git_dir: dot_git });
            }
            if dot_git.is_file() {
                // Worktrees and submodules: `gitdir: <path>`
                let content = fs::read_to_string(&dot_git)
                    .with_context(|| format!("Failed to read '{}'", dot_git.display()))?;
                if let Some(target) = content.trim().strip_prefix("gitdir:") {
                    let target = Path::new(target.trim());
                    let git_dir = if target.is_absolute() {
                        target.to_path_buf()
                    } else {
                        dir.join(target)
                    };
                    return Ok(Self { git_dir });
                }
            }
            current = dir.parent();
        }
        bail!("'{}' is not inside a git repository", start.display())
    }

    /// `owner/repo` of the `origin` remote, for the given GitHub instance.
    pub fn github_slug(&self, instance: &str) -> Result<String> {
        let url = self
            .remote_url("origin")?
            .with_context(|| format!("no 'origin' remote in '{}'", self.git_dir.display()))?;
        parse_github_slug(&url, instance)
            .with_context(|| format!("remote '{}' is not a {} repository", url, instance))
    }

    /// The symbolic ref HEAD points at, or for a detached HEAD the first tag
    /// or branch at the same revision.
    pub fn head_ref(&self) -> Result<String> {
        let head = self.read_head()?;
        if let Some(target) = head.strip_prefix("ref:") {
            return Ok(target.trim().to_string());
        }

        let refs = self.all_refs()?;
        for prefix in ["refs/tags/", "refs/heads/"] {
            if let Some((name, _)) = refs.iter().find(|(name, sha)| name.starts_with(prefix) && *sha == head) {
                return Ok(name.clone());
            }
        }
        bail!("HEAD is detached at {} with no matching ref", head)
    }

    /// The revision HEAD resolves to.
    pub fn head_revision(&self) -> Result<String> {
        let head = self.read_head()?;
        match head.strip_prefix("ref:") {
            Some(target) => self
                .resolve_ref(target.trim())?
                .with_context(|| format!("ref '{}' does not resolve", target.trim())),
            None => Ok(head),
        }
    }

    fn read_head(&self) -> Result<String> {
        let path = self.git_dir.join("HEAD");
        let head = fs::read_to_string(&path).with_context(|| format!("Failed to read '{}'", path.display()))?;
        Ok(head.trim().to_string())
    }

    fn common_dir(&self) -> PathBuf {
        match fs::read_to_string(self.git_dir.join("commondir")) {
            Ok(rel) => self.git_dir.join(rel.trim()),
            Err(_) => self.git_dir.clone(),
        }
    }

    fn resolve_ref(&self, name: &str) -> Result<Option<String>> {
        for dir in [self.git_dir.clone(), self.common_dir()] {
            if let Ok(sha) = fs::read_to_string(dir.join(name)) {
                return Ok(Some(sha.trim().to_string()));
            }
        }
        Ok(self
            .packed_refs()?
            .into_iter()
            .find(|(ref_name, _)| ref_name == name)
            .map(|(_, sha)| sha))
    }

    fn packed_refs(&self) -> Result<Vec<(String, String)>> {
        let content = match fs::read_to_string(self.common_dir().join("packed-refs")) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read packed-refs"),
        };
        Ok(content
            .lines()
            .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
            .filter_map(|line| {
                let (sha, name) = line.split_once(' ')?;
                Some((name.trim().to_string(), sha.trim().to_string()))
            })
            .collect())
    }

    fn all_refs(&self) -> Result<Vec<(String, String)>> {
        let mut refs = Vec::new();
        let root = self.common_dir();
        for entry in walkdir::WalkDir::new(root.join("refs"))
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Ok(rel) = entry.path().strip_prefix(&root) else {
                continue;
            };
            if let Ok(sha) = fs::read_to_string(entry.path()) {
                refs.push((rel.to_string_lossy().replace('\\', "/"), sha.trim().to_string()));
            }
        }
        refs.extend(self.packed_refs()?);
        Ok(refs)
    }

    fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        let path = self.common_dir().join("config");
        let content = fs::read_to_string(&path).with_context(|| format!("Failed to read '{}'", path.display()))?;
        let header = format!("[remote \"{}\"]", remote);

        let mut in_section = false;
        for line in content.lines().map(str::trim) {
            if line.starts_with('[') {
                in_section = line == header;
                continue;
            }
            if !in_section {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                if key.trim() == "url" {
                    return Ok(Some(value.trim().to_string()));
                }
            }
        }
        Ok(None)
    }
}

/// `owner/repo` from an https, ssh or scp-style remote URL on `instance`.
pub fn parse_github_slug(url: &str, instance: &str) -> Option<String> {
    let pattern = format!(
        r"^(?:https?://(?:[^@/]+@)?|ssh://(?:[^@/]+@)?|git@){}[:/](.+?)(?:\.git)?/?$",
        regex::escape(instance)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(url)
        .and_then(|caps| caps.get(1))
        .map(|slug| slug.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(root: &Path, head: &str) -> PathBuf {
        let git = root.join(".git");
        fs::create_dir_all(git.join("refs/heads")).unwrap();
        fs::create_dir_all(git.join("refs/tags")).unwrap();
        fs::write(git.join("HEAD"), head).unwrap();
        fs::write(
            git.join("config"),
            "[core]\n\tbare = false\n[remote \"origin\"]\n\turl = git@github.com:octo/hello.git\n\tfetch = +refs/heads/*:refs/remotes/origin/*\n",
        )
        .unwrap();
        git
    }

    #[test]
    fn test_parse_github_slug() {
        assert_eq!(parse_github_slug("https://github.com/octo/hello.git", "github.com").as_deref(), Some("octo/hello"));
        assert_eq!(parse_github_slug("git@github.com:octo/hello.git", "github.com").as_deref(), Some("octo/hello"));
        assert_eq!(parse_github_slug("ssh://git@ghe.corp/octo/hello", "ghe.corp").as_deref(), Some("octo/hello"));
        assert_eq!(parse_github_slug("https://gitlab.com/octo/hello", "github.com"), None);
    }

    #[test]
    fn test_branch_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let git = init_repo(dir.path(), "ref: refs/heads/main\n");
        fs::write(git.join("refs/heads/main"), "abc123\n").unwrap();
        let nested = dir.path().join("src/deep");
        fs::create_dir_all(&nested).unwrap();

        let repo = GitRepo::discover(&nested).unwrap();
        assert_eq!(repo.head_ref().unwrap(), "refs/heads/main");
        assert_eq!(repo.head_revision().unwrap(), "abc123");
        assert_eq!(repo.github_slug("github.com").unwrap(), "octo/hello");
    }

    #[test]
    fn test_detached_head_matches_packed_tag() {
        let dir = tempfile::tempdir().unwrap();
        let git = init_repo(dir.path(), "deadbeef\n");
        fs::write(
            git.join("packed-refs"),
            "# pack-refs with: peeled\ndeadbeef refs/tags/v1.0\n^cafef00d\n",
        )
        .unwrap();
        let repo = GitRepo::discover(dir.path()).unwrap();
        assert_eq!(repo.head_ref().unwrap(), "refs/tags/v1.0");
        assert_eq!(repo.head_revision().unwrap(), "deadbeef");
    }

    #[test]
    fn test_not_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        // A tempdir may itself live under a repository; only assert on the error shape.
        if let Err(e) = GitRepo::discover(dir.path()) {
            assert!(e.to_string().contains("not inside a git repository"));
        }
    }
}
