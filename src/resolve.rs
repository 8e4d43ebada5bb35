//! Path resolution: tokenizing, walking the descriptor tree, and chasing
//! symlinks with a bounded redirection count.

use std::rc::Rc;

use crate::{
    error::{Error, Result},
    format::{NAME_MAX, PATH_MAX},
    image::VaFs,
    tree::{DirectoryNode, FileNode, Node, SymlinkNode},
};

/// Redirection cap for one lookup.
pub(crate) const MAX_SYMLINK_REDIRECTS: usize = 40;

/// Minimal stat shape exposed by [`VaFs::stat`](crate::VaFs::stat).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    /// File type bits combined with the stored permissions.
    pub mode: u32,
    /// File length for regular files, 0 otherwise.
    pub size: u64,
}

/// Outcome of a path walk.
pub(crate) enum Resolved {
    Directory(Rc<DirectoryNode>),
    File(Rc<FileNode>),
    Symlink(Rc<SymlinkNode>),
}

/// Checks a single entry name: non-empty, no separators, within the name
/// length limit.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::InvalidArgument("invalid entry name"));
    }
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

/// The empty path and any run of separators denote the root directory.
pub(crate) fn is_root(path: &str) -> bool {
    path.bytes().all(|b| b == b'/')
}

/// Splits a path on `/`, collapsing runs and ignoring leading separators.
fn tokenize(path: &str) -> Result<Vec<String>> {
    if path.len() > PATH_MAX {
        return Err(Error::NameTooLong);
    }

    let mut tokens = Vec::new();
    for token in path.split('/') {
        if token.is_empty() {
            continue;
        }
        if token.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }
        tokens.push(token.to_owned());
    }
    Ok(tokens)
}

/// Builds the restart path for a symlink hit: the directory prefix already
/// walked, the link target (with `.` and `..` canonicalized, `..` clamping
/// at root), and whatever tokens remained after the link.
fn splice(prefix: &[String], target: &str, suffix: &[String]) -> Result<String> {
    let mut segments: Vec<String> = prefix.to_vec();

    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => {
                if other.len() > NAME_MAX {
                    return Err(Error::NameTooLong);
                }
                segments.push(other.to_owned());
            }
        }
    }
    segments.extend(suffix.iter().cloned());

    let mut path = String::from("/");
    path.push_str(&segments.join("/"));
    if path.len() > PATH_MAX {
        return Err(Error::NameTooLong);
    }
    Ok(path)
}

/// Walks `path` from the root. Symlinks met mid-path always redirect;
/// a symlink in terminal position redirects only when `follow_terminal`
/// is set (file and directory opens follow, stat and symlink opens do
/// not).
pub(crate) fn walk(image: &VaFs, path: &str, follow_terminal: bool) -> Result<Resolved> {
    let mut current = path.to_owned();
    let mut redirects = 0usize;

    'restart: loop {
        let tokens = tokenize(&current)?;
        if tokens.is_empty() {
            return Ok(Resolved::Directory(image.root().clone()));
        }

        let mut dir = image.root().clone();
        for (index, token) in tokens.iter().enumerate() {
            let node = dir
                .find(image, token)?
                .ok_or_else(|| Error::NoSuchEntry(token.clone()))?;
            let terminal = index + 1 == tokens.len();

            match node {
                Node::Directory(sub) => {
                    if terminal {
                        return Ok(Resolved::Directory(sub));
                    }
                    dir = sub;
                }
                Node::File(file) => {
                    if terminal {
                        return Ok(Resolved::File(file));
                    }
                    return Err(Error::NotADirectory(token.clone()));
                }
                Node::Symlink(link) => {
                    if terminal && !follow_terminal {
                        return Ok(Resolved::Symlink(link));
                    }

                    redirects += 1;
                    if redirects > MAX_SYMLINK_REDIRECTS {
                        return Err(Error::TooManyLinks);
                    }
                    current = splice(&tokens[..index], &link.target, &tokens[index + 1..])?;
                    continue 'restart;
                }
            }
        }
        unreachable!("walk over a non-empty token list always returns");
    }
}
