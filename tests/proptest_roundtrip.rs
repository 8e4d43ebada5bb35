//! Property tests: whatever goes into an image comes back out, and the
//! overview feature accounts for exactly what was stored.

use std::collections::BTreeMap;

use proptest::prelude::*;
use vafs::{format, Feature, VaFs, VaFsConfig, FEATURE_OVERVIEW};

/// File names that cannot collide with the fixed directory names below.
fn file_name_strategy() -> impl Strategy<Value = String> {
    "f[a-z0-9_.-]{0,12}"
}

/// Per-file payload, permissions, and placement (index into `DIRS`).
fn file_strategy() -> impl Strategy<Value = (Vec<u8>, u32, usize)> {
    (
        prop::collection::vec(any::<u8>(), 0..4096),
        prop::bits::u32::masked(0o777),
        0usize..4,
    )
}

/// Directories the generated files are spread across; index 0 is the root.
const DIRS: &[&str] = &["/", "/d0", "/d1", "/d0/nested"];

fn build_image(
    path: &std::path::Path,
    block_size: u32,
    files: &BTreeMap<String, (Vec<u8>, u32, usize)>,
) {
    let mut config = VaFsConfig::new();
    config.set_block_size(block_size);
    let image = VaFs::create(path, &config).unwrap();
    {
        let root = image.open_directory("/").unwrap();
        let d0 = root.create_directory("d0", 0o755).unwrap();
        root.create_directory("d1", 0o750).unwrap();
        d0.create_directory("nested", 0o700).unwrap();
    }

    for (name, (contents, permissions, dir_index)) in files {
        let dir = image.open_directory(DIRS[*dir_index]).unwrap();
        let mut file = dir.create_file(name, *permissions).unwrap();
        if !contents.is_empty() {
            file.write(contents).unwrap();
        }
    }
    image.close().unwrap();
}

fn full_path(dir_index: usize, name: &str) -> String {
    if DIRS[dir_index] == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", DIRS[dir_index])
    }
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

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        .. ProptestConfig::default()
    })]

    /// Everything written is present with identical bytes, permissions,
    /// and size after a reopen.
    #[test]
    fn roundtrip_preserves_files(
        files in prop::collection::btree_map(file_name_strategy(), file_strategy(), 1..10)
    ) {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("image.vafs");
        build_image(&path, format::BLOCK_SIZE_MIN, &files);

        let image = VaFs::open(&path).unwrap();
        for (name, (contents, permissions, dir_index)) in &files {
            let path = full_path(*dir_index, name);

            let stat = image.stat(&path).unwrap();
            prop_assert_eq!(stat.mode, format::S_IFREG | *permissions);
            prop_assert_eq!(stat.size, contents.len() as u64);

            let file = image.open_file(&path).unwrap();
            prop_assert_eq!(file.permissions(), *permissions);
            drop(file);
            prop_assert_eq!(&read_all(&image, &path), contents);
        }
    }

    /// The overview feature matches the exact counts and byte totals of
    /// the stored tree.
    #[test]
    fn overview_accounts_for_everything(
        files in prop::collection::btree_map(file_name_strategy(), file_strategy(), 0..8)
    ) {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("image.vafs");
        build_image(&path, format::BLOCK_SIZE_MIN, &files);

        let image = VaFs::open(&path).unwrap();
        let overview = match image.feature_query(&FEATURE_OVERVIEW) {
            Some(Feature::Overview(overview)) => *overview,
            other => return Err(TestCaseError::fail(format!("missing overview: {other:?}"))),
        };

        let total: u64 = files.values().map(|(contents, ..)| contents.len() as u64).sum();
        prop_assert_eq!(overview.files, files.len() as u32);
        prop_assert_eq!(overview.directories, 3);
        prop_assert_eq!(overview.symlinks, 0);
        prop_assert_eq!(overview.total_uncompressed_bytes, total);
    }

    /// Contents that span many blocks survive, whatever the split.
    #[test]
    fn roundtrip_across_block_boundaries(
        length in 0usize..40_000,
        seed in any::<u8>(),
    ) {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("image.vafs");

        let payload: Vec<u8> = (0..length).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();

        let mut config = VaFsConfig::new();
        config.set_block_size(format::BLOCK_SIZE_MIN);
        let image = VaFs::create(&path, &config).unwrap();
        {
            let root = image.open_directory("/").unwrap();
            let mut file = root.create_file("payload", 0o644).unwrap();
            if !payload.is_empty() {
                file.write(&payload).unwrap();
            }
        }
        image.close().unwrap();

        let image = VaFs::open(&path).unwrap();
        prop_assert_eq!(read_all(&image, "/payload"), payload);
    }
}
