//! Symlink resolution: chains, loops, relative and dot-segment targets,
//! and the redirection cap.

use std::path::PathBuf;

use similar_asserts::assert_eq;
use vafs::{format, Error, VaFs, VaFsConfig};

fn scratch_image() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.vafs");
    (dir, path)
}

fn read_all(image: &VaFs, path: &str) -> Vec<u8> {
    let mut file = image.open_file(path).unwrap();
    let mut contents = vec![0u8; file.length() as usize];
    let mut filled = 0;
    while filled < contents.len() {
        let count = file.read(&mut contents[filled..]).unwrap();
        assert!(count > 0);
        filled += count;
    }
    contents
}

/// Builds `l1 -> l2 -> … -> l<n> -> f` where `f` holds `contents`.
fn build_chain(path: &PathBuf, links: usize, contents: &[u8]) {
    let image = VaFs::create(path, &VaFsConfig::new()).unwrap();
    {
        let root = image.open_directory("/").unwrap();
        let mut file = root.create_file("f", 0o644).unwrap();
        file.write(contents).unwrap();
        drop(file);

        for index in 1..=links {
            let target = if index == links {
                "f".to_string()
            } else {
                format!("l{}", index + 1)
            };
            root.create_symlink(&format!("l{index}"), &target).unwrap();
        }
    }
    image.close().unwrap();
}

#[test]
fn chain_of_forty_resolves() {
    let (_scratch, path) = scratch_image();
    build_chain(&path, 40, b"end of the chain");

    let image = VaFs::open(&path).unwrap();
    // 40 redirections is exactly the cap
    assert_eq!(read_all(&image, "/l1"), b"end of the chain");
}

#[test]
fn chain_of_forty_one_is_too_long() {
    let (_scratch, path) = scratch_image();
    build_chain(&path, 41, b"unreachable");

    let image = VaFs::open(&path).unwrap();
    assert!(matches!(
        image.open_file("/l1"),
        Err(Error::TooManyLinks)
    ));
    // one step further down the chain is within the cap again
    assert_eq!(read_all(&image, "/l2"), b"unreachable");
}

#[test]
fn symlink_loop_fails() {
    let (_scratch, path) = scratch_image();
    let image = VaFs::create(&path, &VaFsConfig::new()).unwrap();
    {
        let root = image.open_directory("/").unwrap();
        root.create_symlink("a", "b").unwrap();
        root.create_symlink("b", "a").unwrap();
    }
    image.close().unwrap();

    let image = VaFs::open(&path).unwrap();
    assert!(matches!(
        image.open_file("/a"),
        Err(Error::TooManyLinks)
    ));
}

#[test]
fn relative_targets_with_dot_segments() {
    let (_scratch, path) = scratch_image();
    let image = VaFs::create(&path, &VaFsConfig::new()).unwrap();
    {
        let root = image.open_directory("/").unwrap();
        let d = root.create_directory("d", 0o755).unwrap();
        let sub = d.create_directory("sub", 0o755).unwrap();

        let mut x = d.create_file("x", 0o644).unwrap();
        x.write(b"sibling of sub").unwrap();
        drop(x);

        sub.create_symlink("up", "../x").unwrap();
        sub.create_symlink("here", "./../x").unwrap();
        root.create_symlink("clamped", "../../d/x").unwrap();
    }
    image.close().unwrap();

    let image = VaFs::open(&path).unwrap();
    assert_eq!(read_all(&image, "/d/sub/up"), b"sibling of sub");
    assert_eq!(read_all(&image, "/d/sub/here"), b"sibling of sub");
    // `..` above the root clamps instead of failing
    assert_eq!(read_all(&image, "/clamped"), b"sibling of sub");
}

#[test]
fn mid_path_symlinks_resolve() {
    let (_scratch, path) = scratch_image();
    let image = VaFs::create(&path, &VaFsConfig::new()).unwrap();
    {
        let root = image.open_directory("/").unwrap();
        let d = root.create_directory("d", 0o755).unwrap();
        let mut b = d.create_file("b", 0o644).unwrap();
        b.write(b"under d").unwrap();
        drop(b);
        root.create_symlink("link", "d").unwrap();
    }
    image.close().unwrap();

    let image = VaFs::open(&path).unwrap();
    assert_eq!(read_all(&image, "/link/b"), b"under d");

    // directory opens follow the link as well
    let through = image.open_directory("/link").unwrap();
    let mut names = Vec::new();
    let mut handle = through;
    while let Some(entry) = handle.read_entry().unwrap() {
        names.push(entry.name);
    }
    assert_eq!(names, vec!["b".to_string()]);
}

#[test]
fn stat_does_not_follow_terminal_symlinks() {
    let (_scratch, path) = scratch_image();
    let image = VaFs::create(&path, &VaFsConfig::new()).unwrap();
    {
        let root = image.open_directory("/").unwrap();
        let mut f = root.create_file("target", 0o600).unwrap();
        f.write(b"1234").unwrap();
        drop(f);
        root.create_symlink("ln", "target").unwrap();
    }
    image.close().unwrap();

    let image = VaFs::open(&path).unwrap();

    let link_stat = image.stat("/ln").unwrap();
    assert_eq!(link_stat.mode & format::S_IFMT, format::S_IFLNK);
    assert_eq!(link_stat.size, 0);

    let file_stat = image.stat("/target").unwrap();
    assert_eq!(file_stat.mode, format::S_IFREG | 0o600);
    assert_eq!(file_stat.size, 4);

    // file opens do follow it
    assert_eq!(read_all(&image, "/ln"), b"1234");
}

#[test]
fn symlink_handles_expose_raw_targets() {
    let (_scratch, path) = scratch_image();
    let image = VaFs::create(&path, &VaFsConfig::new()).unwrap();
    {
        let root = image.open_directory("/").unwrap();
        root.create_symlink("ln", "some/../raw//target").unwrap();
    }
    image.close().unwrap();

    let image = VaFs::open(&path).unwrap();
    let handle = image.open_symlink("/ln").unwrap();
    // the stored target is untouched by canonicalization
    assert_eq!(handle.target(), "some/../raw//target");

    assert!(matches!(
        image.open_symlink("/"),
        Err(Error::IsADirectory(_))
    ));
    assert!(matches!(
        image.open_symlink("/missing"),
        Err(Error::NoSuchEntry(_))
    ));
}

#[test]
fn resolution_matches_direct_access() {
    let (_scratch, path) = scratch_image();
    let image = VaFs::create(&path, &VaFsConfig::new()).unwrap();
    {
        let root = image.open_directory("/").unwrap();
        let a = root.create_directory("a", 0o755).unwrap();
        let b = a.create_directory("b", 0o755).unwrap();
        let mut f = b.create_file("data", 0o644).unwrap();
        f.write(&(0..2048u32).flat_map(u32::to_le_bytes).collect::<Vec<u8>>())
            .unwrap();
        drop(f);

        root.create_symlink("s1", "a/b/data").unwrap();
        a.create_symlink("s2", "b/data").unwrap();
        b.create_symlink("s3", "data").unwrap();
    }
    image.close().unwrap();

    let image = VaFs::open(&path).unwrap();
    let direct = read_all(&image, "/a/b/data");
    for linked in ["/s1", "/a/s2", "/a/b/s3"] {
        assert_eq!(read_all(&image, linked), direct, "via {linked}");
    }
}
