//! Filter installation and transparency: images written with a per-block
//! filter read back identically once the matching callbacks are installed,
//! and refuse to decode without them.

use std::{path::PathBuf, rc::Rc};

use similar_asserts::assert_eq;
use vafs::{Error, Feature, FilterOps, VaFs, VaFsConfig, FEATURE_FILTER};

const FILTER_XOR: u32 = 1;

/// XORs every byte with a key; its own inverse, so decode == encode.
struct XorFilter(u8);

impl FilterOps for XorFilter {
    fn encode(&self, input: &[u8]) -> vafs::Result<Vec<u8>> {
        Ok(input.iter().map(|b| b ^ self.0).collect())
    }

    fn decode(&self, input: &[u8], output: &mut [u8]) -> vafs::Result<usize> {
        if input.len() > output.len() {
            return Err(Error::InvalidArgument("encoded block too large"));
        }
        for (out, byte) in output.iter_mut().zip(input) {
            *out = byte ^ self.0;
        }
        Ok(input.len())
    }
}

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

fn create_filtered_image(path: &PathBuf, contents: &[u8]) {
    let mut config = VaFsConfig::new();
    config.set_block_size(128 * 1024);
    config.set_filter(FILTER_XOR, Rc::new(XorFilter(0x5A)));

    let image = VaFs::create(path, &config).unwrap();
    {
        let root = image.open_directory("/").unwrap();
        let mut file = root.create_file("blob", 0o644).unwrap();
        file.write(contents).unwrap();
    }
    image.close().unwrap();
}

#[test]
fn filtered_image_requires_callbacks() {
    let (_scratch, path) = scratch_image();
    let contents = vec![0u8; 200 * 1024];
    create_filtered_image(&path, &contents);

    // without the filter installed, any access that touches a block fails
    let image = VaFs::open(&path).unwrap();
    assert_eq!(image.filter(), Some(FILTER_XOR));
    assert!(matches!(
        image.open_file("/blob"),
        Err(Error::UnsupportedFilter)
    ));

    // with it, everything decodes
    let image = VaFs::open(&path).unwrap();
    image
        .install_filter(FILTER_XOR, Rc::new(XorFilter(0x5A)))
        .unwrap();
    assert_eq!(read_all(&image, "/blob"), contents);
}

#[test]
fn filter_family_must_match() {
    let (_scratch, path) = scratch_image();
    create_filtered_image(&path, b"short payload");

    let image = VaFs::open(&path).unwrap();
    assert!(matches!(
        image.install_filter(FILTER_XOR + 1, Rc::new(XorFilter(0x5A))),
        Err(Error::InvalidArgument(_))
    ));

    // the filter feature is visible in the feature table
    match image.feature_query(&FEATURE_FILTER) {
        Some(Feature::Filter(id)) => assert_eq!(*id, FILTER_XOR),
        other => panic!("expected filter feature, got {other:?}"),
    }
}

#[test]
fn unfiltered_image_rejects_filter_installation() {
    let (_scratch, path) = scratch_image();
    let image = VaFs::create(&path, &VaFsConfig::new()).unwrap();
    image.close().unwrap();

    let image = VaFs::open(&path).unwrap();
    assert_eq!(image.filter(), None);
    assert!(matches!(
        image.install_filter(FILTER_XOR, Rc::new(XorFilter(0x5A))),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn filter_is_transparent() {
    let payloads: Vec<Vec<u8>> = vec![
        b"tiny".to_vec(),
        (0..9000u32).map(|v| (v % 253) as u8).collect(),
        vec![0x5A; 4096], // encodes to all zeroes under the xor key
    ];

    let build = |path: &PathBuf, filtered: bool| {
        let mut config = VaFsConfig::new();
        config.set_block_size(8 * 1024);
        if filtered {
            config.set_filter(FILTER_XOR, Rc::new(XorFilter(0x5A)));
        }
        let image = VaFs::create(path, &config).unwrap();
        {
            let root = image.open_directory("/").unwrap();
            for (index, payload) in payloads.iter().enumerate() {
                let mut file = root.create_file(&format!("f{index}"), 0o644).unwrap();
                file.write(payload).unwrap();
            }
        }
        image.close().unwrap();
    };

    let (_scratch_a, plain_path) = scratch_image();
    let (_scratch_b, filtered_path) = scratch_image();
    build(&plain_path, false);
    build(&filtered_path, true);

    let plain = VaFs::open(&plain_path).unwrap();
    let filtered = VaFs::open(&filtered_path).unwrap();
    filtered
        .install_filter(FILTER_XOR, Rc::new(XorFilter(0x5A)))
        .unwrap();

    for (index, payload) in payloads.iter().enumerate() {
        let path = format!("/f{index}");
        assert_eq!(read_all(&plain, &path), *payload);
        assert_eq!(read_all(&filtered, &path), *payload);
        assert_eq!(
            plain.stat(&path).unwrap(),
            filtered.stat(&path).unwrap(),
        );
    }
}
