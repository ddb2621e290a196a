mod common;

use cell_self::keys::{KeyVault, LookupError, SelfType};
use cell_self::npdrm::{LicenseStore, RapDirectory, UnwrapError};
use cell_self::{DecryptError, Decrypter, Outcome, container, header, metadata, writer};
use common::{CONTENT_ID, ERK, RAP, SelfBuilder, Segment, pattern, vault};
use std::io::{self, Cursor};

struct NoLicenses;

impl LicenseStore for NoLicenses {
    fn find_rap(&self, _: &str) -> io::Result<Option<[u8; 16]>> {
        panic!("license store must not be consulted");
    }
}

fn run<L: LicenseStore>(
    vault: &KeyVault,
    licenses: L,
    self_bytes: &[u8],
) -> Result<(Outcome, Vec<u8>), DecryptError> {
    let mut output = Cursor::new(Vec::new());
    let outcome =
        Decrypter::new(vault, licenses).decrypt(&mut Cursor::new(self_bytes), &mut output)?;

    Ok((outcome, output.into_inner()))
}

#[test]
fn app_self_unwraps_to_elf() {
    let fixture = SelfBuilder {
        segments: vec![
            Segment::encrypted(pattern(0x300, 1)).compressed(),
            Segment::encrypted(pattern(0x180, 2)),
            Segment::plain(pattern(0x40, 3)),
        ],
        section_headers: true,
        ..SelfBuilder::default()
    }
    .build();

    let (outcome, elf) = run(&vault(), NoLicenses, &fixture.self_bytes).unwrap();

    assert_eq!(outcome, Outcome::Decrypted);
    assert_eq!(elf.len(), fixture.elf_bytes.len());
    assert_eq!(elf, fixture.elf_bytes);
}

#[test]
fn elf32_compressed_segment() {
    let fixture = SelfBuilder {
        elf32: true,
        segments: vec![Segment::encrypted(vec![0x42; 0x800]).compressed()],
        ..SelfBuilder::default()
    }
    .build();

    let (_, elf) = run(&vault(), NoLicenses, &fixture.self_bytes).unwrap();

    assert_eq!(&elf[..4], b"\x7FELF");
    assert_eq!(elf[4], 1);
    assert_eq!(elf, fixture.elf_bytes);
}

#[test]
fn output_is_deterministic() {
    let fixture = SelfBuilder {
        segments: vec![Segment::encrypted(pattern(0x200, 9))],
        ..SelfBuilder::default()
    }
    .build();
    let vault = vault();

    let (_, a) = run(&vault, NoLicenses, &fixture.self_bytes).unwrap();
    let (_, b) = run(&vault, NoLicenses, &fixture.self_bytes).unwrap();

    assert_eq!(a, b);
}

#[test]
fn debug_self_is_copied_verbatim() {
    let mut raw = Vec::new();
    raw.extend_from_slice(&0x5343_4500u32.to_be_bytes());
    raw.extend_from_slice(&2u32.to_be_bytes());
    raw.extend_from_slice(&0x8000u16.to_be_bytes());
    raw.extend_from_slice(&1u16.to_be_bytes());
    raw.extend_from_slice(&0u32.to_be_bytes());
    raw.extend_from_slice(&0x100u64.to_be_bytes());
    raw.extend_from_slice(&0u64.to_be_bytes());
    raw.resize(0x100, 0xEE);

    let embedded = pattern(0x321, 4);
    raw.extend_from_slice(&embedded);

    // No keys needed at all.
    let (outcome, elf) = run(&KeyVault::default(), NoLicenses, &raw).unwrap();

    assert_eq!(outcome, Outcome::DebugPassthrough);
    assert_eq!(elf, embedded);
}

#[test]
fn debug_flag_skips_keyset_lookup() {
    let fixture = SelfBuilder {
        flags: 0x8000 | 0x000A,
        segments: vec![Segment::encrypted(pattern(0x100, 5))],
        ..SelfBuilder::default()
    }
    .build();

    let (outcome, elf) = run(&KeyVault::default(), NoLicenses, &fixture.self_bytes).unwrap();

    assert_eq!(outcome, Outcome::Decrypted);
    assert_eq!(elf, fixture.elf_bytes);
}

#[test]
fn free_license_needs_no_rap() {
    let fixture = SelfBuilder {
        self_type: SelfType::Npdrm,
        license: Some(3),
        segments: vec![Segment::encrypted(pattern(0x400, 6)).compressed()],
        ..SelfBuilder::default()
    }
    .build();

    let (_, elf) = run(&vault(), NoLicenses, &fixture.self_bytes).unwrap();

    assert_eq!(elf, fixture.elf_bytes);
}

#[test]
fn local_license_uses_rap_file() {
    let fixture = SelfBuilder {
        self_type: SelfType::Npdrm,
        license: Some(2),
        segments: vec![Segment::encrypted(pattern(0x200, 7))],
        ..SelfBuilder::default()
    }
    .build();

    let dev_hdd0 = tempfile::tempdir().unwrap();
    let store = RapDirectory::new(dev_hdd0.path());
    let vault = vault();

    let err = run(&vault, &store, &fixture.self_bytes).unwrap_err();
    assert!(matches!(
        err,
        DecryptError::LoadMetadataFailed {
            source: metadata::DecryptError::Npdrm {
                source: UnwrapError::MissingRap { ref content_id }
            }
        } if content_id == CONTENT_ID
    ));

    let rap = store.rap_path(CONTENT_ID);
    std::fs::create_dir_all(rap.parent().unwrap()).unwrap();
    std::fs::write(&rap, RAP).unwrap();

    let (_, elf) = run(&vault, &store, &fixture.self_bytes).unwrap();
    assert_eq!(elf, fixture.elf_bytes);
}

#[test]
fn network_license_is_unsupported() {
    let fixture = SelfBuilder {
        self_type: SelfType::Npdrm,
        license: Some(1),
        segments: vec![Segment::encrypted(pattern(0x10, 8))],
        ..SelfBuilder::default()
    }
    .build();

    let err = run(&vault(), NoLicenses, &fixture.self_bytes).unwrap_err();

    assert!(matches!(
        err,
        DecryptError::LoadMetadataFailed {
            source: metadata::DecryptError::Npdrm {
                source: UnwrapError::NetworkLicense { .. }
            }
        }
    ));
}

#[test]
fn wrong_erk_fails_padding_check() {
    let fixture = SelfBuilder {
        segments: vec![Segment::encrypted(pattern(0x100, 10))],
        ..SelfBuilder::default()
    }
    .build();

    let mut erk = ERK;
    erk[0] ^= 0x01;

    let vault = KeyVault::new(vec![cell_self::keys::SelfKey {
        erk,
        ..vault().lookup(SelfType::App, common::REVISION, 0).unwrap().clone()
    }]);

    let err = run(&vault, NoLicenses, &fixture.self_bytes).unwrap_err();

    assert!(matches!(
        err,
        DecryptError::LoadMetadataFailed {
            source: metadata::DecryptError::InvalidPadding
        }
    ));
}

#[test]
fn unknown_keyset_is_fatal() {
    let fixture = SelfBuilder {
        segments: vec![Segment::encrypted(pattern(0x100, 11))],
        ..SelfBuilder::default()
    }
    .build();

    let err = run(&KeyVault::default(), NoLicenses, &fixture.self_bytes).unwrap_err();

    assert!(matches!(
        err,
        DecryptError::LoadMetadataFailed {
            source: metadata::DecryptError::FindKey {
                source: LookupError::UnknownKeyset {
                    self_type: SelfType::App,
                    ..
                }
            }
        }
    ));
}

#[test]
fn out_of_range_key_index_skips_section() {
    let mut skipped = Segment::encrypted(pattern(0x100, 12));
    skipped.bad_key = true;

    let fixture = SelfBuilder {
        segments: vec![skipped, Segment::encrypted(pattern(0x100, 13))],
        ..SelfBuilder::default()
    }
    .build();

    let (outcome, elf) = run(&vault(), NoLicenses, &fixture.self_bytes).unwrap();

    assert_eq!(outcome, Outcome::Decrypted);
    assert_eq!(elf, fixture.elf_bytes);
    assert!(elf[0x1000..0x1100].iter().all(|&b| b == 0));
}

#[test]
fn truncated_zlib_stream_fails() {
    let mut segment = Segment::encrypted(pattern(0x800, 14)).compressed();
    segment.truncated = true;

    let fixture = SelfBuilder {
        segments: vec![segment],
        ..SelfBuilder::default()
    }
    .build();

    let err = run(&vault(), NoLicenses, &fixture.self_bytes).unwrap_err();

    assert!(matches!(
        err,
        DecryptError::MakeElfFailed {
            source: writer::WriteError::Decompress { index: 0, .. }
        }
    ));
}

/// Overwrites a big-endian `u64` of the SELF image outside the encrypted area.
fn patch_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_be_bytes());
}

// Offsets of fields inside the embedded ELF64 headers of a fixture.
const E_SHOFF: usize = 0x90 + 0x28;
const P_OFFSET_0: usize = 0xD0 + 0x08;
const P_FILESZ_0: usize = 0xD0 + 0x20;

#[test]
fn segment_offset_past_image_limit_fails() {
    let mut fixture = SelfBuilder {
        segments: vec![Segment::encrypted(pattern(0x100, 20))],
        ..SelfBuilder::default()
    }
    .build();

    patch_u64(&mut fixture.self_bytes, P_OFFSET_0, 0x7FFF_FFFF_FFFF_0000);

    let err = run(&vault(), NoLicenses, &fixture.self_bytes).unwrap_err();

    assert!(matches!(
        err,
        DecryptError::MakeElfFailed {
            source: writer::WriteError::SegmentOutOfRange {
                index: 0,
                offset: 0x7FFF_FFFF_FFFF_0000,
                len: 0x100,
            }
        }
    ));

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("EBOOT.BIN");
    let output = dir.path().join("EBOOT.elf");
    std::fs::write(&input, &fixture.self_bytes).unwrap();

    let vault = vault();
    assert!(Decrypter::new(&vault, NoLicenses).decrypt_file(&input, &output).is_err());
    assert!(!output.exists());
}

#[test]
fn section_header_offset_past_image_limit_fails() {
    let mut fixture = SelfBuilder {
        segments: vec![Segment::encrypted(pattern(0x100, 21))],
        section_headers: true,
        ..SelfBuilder::default()
    }
    .build();

    patch_u64(&mut fixture.self_bytes, E_SHOFF, u64::MAX - 0x10);

    let err = run(&vault(), NoLicenses, &fixture.self_bytes).unwrap_err();

    assert!(matches!(
        err,
        DecryptError::MakeElfFailed {
            source: writer::WriteError::HeaderOutOfRange { offset, len: 0x80, .. }
        } if offset == u64::MAX - 0x10
    ));
}

#[test]
fn oversized_inflate_target_fails() {
    let mut fixture = SelfBuilder {
        segments: vec![Segment::encrypted(pattern(0x400, 22)).compressed()],
        ..SelfBuilder::default()
    }
    .build();

    patch_u64(&mut fixture.self_bytes, P_FILESZ_0, u64::MAX);

    let err = run(&vault(), NoLicenses, &fixture.self_bytes).unwrap_err();

    assert!(matches!(
        err,
        DecryptError::MakeElfFailed {
            source: writer::WriteError::Decompress { index: 0, .. }
        }
    ));
}

#[test]
fn non_self_input_is_rejected() {
    let err = run(&vault(), NoLicenses, b"\x7FELF not a SELF at all, just some bytes").unwrap_err();

    assert!(matches!(
        err,
        DecryptError::ReadSceHeaderFailed {
            source: header::ReadError::InvalidMagic
        }
    ));
}

#[test]
fn truncated_headers_are_reported() {
    let fixture = SelfBuilder {
        segments: vec![Segment::plain(pattern(0x10, 15))],
        ..SelfBuilder::default()
    }
    .build();

    let err = run(&vault(), NoLicenses, &fixture.self_bytes[..0x60]).unwrap_err();

    match err {
        DecryptError::LoadHeadersFailed { source } => {
            assert!(source.is_truncated());
            assert!(!source.is_not_self());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(matches!(
        container::SelfContainer::load(&mut Cursor::new(&fixture.self_bytes[..0x10])),
        Err(e) if e.is_truncated()
    ));
}

#[test]
fn headers_load_in_order() {
    let fixture = SelfBuilder {
        self_type: SelfType::Npdrm,
        license: Some(3),
        segments: vec![
            Segment::encrypted(pattern(0x80, 16)),
            Segment::plain(pattern(0x80, 17)),
        ],
        section_headers: true,
        ..SelfBuilder::default()
    }
    .build();

    let c = container::SelfContainer::load(&mut Cursor::new(&fixture.self_bytes)).unwrap();

    assert_eq!(c.app_info().self_type(), SelfType::Npdrm);
    assert_eq!(c.program_headers().len(), 2);
    assert_eq!(c.section_infos().len(), 2);
    assert_eq!(c.section_headers().len(), 2);
    assert_eq!(c.controls().len(), 3);
    assert_eq!(c.npdrm().unwrap().content_id(), CONTENT_ID);
    assert!(!c.is_elf32());
}

#[test]
fn decrypt_file_only_creates_output_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault();
    let decrypter = Decrypter::new(&vault, NoLicenses);

    let fixture = SelfBuilder {
        segments: vec![Segment::encrypted(pattern(0x100, 18))],
        ..SelfBuilder::default()
    }
    .build();

    let input = dir.path().join("EBOOT.BIN");
    let output = dir.path().join("EBOOT.elf");
    std::fs::write(&input, &fixture.self_bytes).unwrap();

    assert_eq!(decrypter.decrypt_file(&input, &output).unwrap(), Outcome::Decrypted);
    assert_eq!(std::fs::read(&output).unwrap(), fixture.elf_bytes);

    let bad = dir.path().join("bad.self");
    let bad_out = dir.path().join("bad.elf");
    std::fs::write(&bad, &fixture.self_bytes[..0x80]).unwrap();

    assert!(decrypter.decrypt_file(&bad, &bad_out).is_err());
    assert!(!bad_out.exists());

    assert!(matches!(
        decrypter.decrypt_file(dir.path().join("missing"), &bad_out),
        Err(DecryptError::OpenInputFailed { .. })
    ));
}

#[test]
fn failed_decrypt_keeps_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let vault = vault();
    let decrypter = Decrypter::new(&vault, NoLicenses);

    let fixture = SelfBuilder {
        segments: vec![Segment::encrypted(pattern(0x100, 23))],
        ..SelfBuilder::default()
    }
    .build();

    let good = dir.path().join("good.self");
    let bad = dir.path().join("bad.self");
    std::fs::write(&good, &fixture.self_bytes).unwrap();
    std::fs::write(&bad, &fixture.self_bytes[..0x80]).unwrap();

    let existing = dir.path().join("existing.elf");
    std::fs::write(&existing, b"previous build").unwrap();

    assert!(decrypter.decrypt_file(&bad, &existing).is_err());
    assert_eq!(std::fs::read(&existing).unwrap(), b"previous build");

    // An output path naming a directory cannot be replaced.
    let taken = dir.path().join("taken");
    std::fs::create_dir(&taken).unwrap();
    std::fs::write(taken.join("keep"), b"x").unwrap();

    assert!(matches!(
        decrypter.decrypt_file(&good, &taken),
        Err(DecryptError::WriteOutputFailed { .. })
    ));
    assert!(taken.join("keep").exists());

    // No temporary images are left behind.
    let mut names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    names.sort();
    assert_eq!(names, ["bad.self", "existing.elf", "good.self", "taken"]);

    // A successful run replaces the previous file.
    assert_eq!(decrypter.decrypt_file(&good, &existing).unwrap(), Outcome::Decrypted);
    assert_eq!(std::fs::read(&existing).unwrap(), fixture.elf_bytes);
}

#[test]
fn self_detection() {
    let dir = tempfile::tempdir().unwrap();

    let elf64 = dir.path().join("a.self");
    let elf32 = dir.path().join("b.self");
    let other = dir.path().join("c.bin");

    let build = |elf32| {
        SelfBuilder {
            elf32,
            segments: vec![Segment::plain(pattern(0x10, 19))],
            ..SelfBuilder::default()
        }
        .build()
        .self_bytes
    };

    std::fs::write(&elf64, build(false)).unwrap();
    std::fs::write(&elf32, build(true)).unwrap();
    std::fs::write(&other, b"nope").unwrap();

    assert!(cell_self::is_self(&elf64));
    assert!(cell_self::is_self(&elf32));
    assert!(!cell_self::is_self(&other));
    assert!(!cell_self::is_self(dir.path().join("missing")));

    assert!(!cell_self::is_self_elf32(&elf64));
    assert!(cell_self::is_self_elf32(&elf32));
    assert!(!cell_self::is_self_elf32(&other));
}
