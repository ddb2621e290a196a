//! SELF fixtures built from scratch, encrypted the way retail files are.
#![allow(dead_code)]

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncryptMut, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};
use cell_self::elf::{ElfHeader, ProgramHeader, SectionHeader};
use cell_self::keys::{KeyVault, NP_KLIC_FREE, NP_KLIC_KEY, SelfKey, SelfType};
use cell_self::rap::rap_to_rif;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::io::Write;

pub const ERK: [u8; 32] = [
    0x34, 0x18, 0x12, 0x37, 0x62, 0x91, 0x37, 0x1C, 0x8B, 0xC7, 0x56, 0xFF, 0xFC, 0x61, 0x15, 0x25,
    0x40, 0x3F, 0x95, 0xA8, 0xEF, 0x9D, 0x0C, 0x99, 0x64, 0x82, 0xEE, 0xC2, 0x16, 0xB5, 0x62, 0xED,
];

pub const RIV: [u8; 16] = [
    0xE8, 0x66, 0x3A, 0x69, 0xCD, 0x1A, 0x5C, 0x45, 0x4A, 0x76, 0x1E, 0x72, 0x8C, 0x7C, 0x25, 0x4E,
];

pub const REVISION: u16 = 0x000A;
pub const VERSION: u64 = 0x0003_0040_0000_0000;
pub const CONTENT_ID: &str = "UP0001-NPUB00001_00-0000000000000001";
pub const RAP: [u8; 16] = [
    0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0xFE, 0xDC, 0xBA, 0x98, 0x76, 0x54, 0x32, 0x10,
];

const META_KEY: [u8; 16] = [0xA5; 16];
const META_IV: [u8; 16] = [0x5A; 16];

/// A vault holding the fixture keysets for APP and NPDRM SELFs.
pub fn vault() -> KeyVault {
    KeyVault::new(vec![
        SelfKey {
            self_type: SelfType::App,
            revision: REVISION,
            version: VERSION,
            erk: ERK,
            riv: RIV,
        },
        SelfKey {
            self_type: SelfType::Npdrm,
            revision: REVISION,
            version: VERSION,
            erk: ERK,
            riv: RIV,
        },
    ])
}

/// Deterministic filler data.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// One program segment of the fixture.
#[derive(Debug, Clone)]
pub struct Segment {
    pub data: Vec<u8>,
    pub encrypted: bool,
    pub compressed: bool,
    /// Cut the zlib stream in half before storing it.
    pub truncated: bool,
    /// Reference a key pool entry past the end of the pool.
    pub bad_key: bool,
}

impl Segment {
    pub fn plain(data: Vec<u8>) -> Self {
        Self {
            data,
            encrypted: false,
            compressed: false,
            truncated: false,
            bad_key: false,
        }
    }

    pub fn encrypted(data: Vec<u8>) -> Self {
        Self {
            encrypted: true,
            ..Self::plain(data)
        }
    }

    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }
}

/// A fixture SELF plus the ELF it must unwrap to.
pub struct Fixture {
    pub self_bytes: Vec<u8>,
    pub elf_bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SelfBuilder {
    pub self_type: SelfType,
    pub flags: u16,
    pub elf32: bool,
    pub segments: Vec<Segment>,
    /// NPDRM license type; `None` omits the NPDRM control info.
    pub license: Option<u32>,
    pub section_headers: bool,
}

impl Default for SelfBuilder {
    fn default() -> Self {
        Self {
            self_type: SelfType::App,
            flags: REVISION,
            elf32: false,
            segments: Vec::new(),
            license: None,
            section_headers: false,
        }
    }
}

fn align16(v: usize) -> usize {
    (v + 15) & !15
}

fn put(buf: &mut Vec<u8>, offset: usize, data: &[u8]) {
    if buf.len() < offset + data.len() {
        buf.resize(offset + data.len(), 0);
    }
    buf[offset..offset + data.len()].copy_from_slice(data);
}

fn be(fields: &[&dyn ToBe]) -> Vec<u8> {
    fields.iter().flat_map(|f| f.to_be()).collect()
}

trait ToBe {
    fn to_be(&self) -> Vec<u8>;
}

impl ToBe for u16 {
    fn to_be(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
}

impl ToBe for u32 {
    fn to_be(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
}

impl ToBe for u64 {
    fn to_be(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
}

fn ctr_apply(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    ctr::Ctr128BE::<Aes128>::new(key.into(), iv.into()).apply_keystream(data);
}

fn cbc128_encrypt(key: &[u8; 16], data: &mut [u8]) {
    let mut enc = cbc::Encryptor::<Aes128>::new(key.into(), (&[0u8; 16]).into());
    for block in data.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn cbc256_encrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
    let mut enc = cbc::Encryptor::<Aes256>::new(key.into(), iv.into());
    for block in data.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn klicensee(license: u32) -> [u8; 16] {
    match license {
        2 => rap_to_rif(&RAP),
        _ => NP_KLIC_FREE,
    }
}

impl SelfBuilder {
    pub fn build(&self) -> Fixture {
        let n = self.segments.len();
        let (ehsize, phsize, shsize) = if self.elf32 {
            (0x34usize, 0x20usize, 0x28usize)
        } else {
            (0x40, 0x38, 0x40)
        };

        // Output ELF layout.
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(b"\x7FELF");
        ident[4] = if self.elf32 { 1 } else { 2 };
        ident[5] = 2;
        ident[6] = 1;
        ident[7] = 0x66;

        let phdrs: Vec<ProgramHeader> = self
            .segments
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let offset = 0x1000 * (i as u64 + 1);
                ProgramHeader {
                    p_type: 1,
                    p_flags: 5,
                    p_offset: offset,
                    p_vaddr: 0x10000 + offset,
                    p_paddr: 0x10000 + offset,
                    p_filesz: s.data.len() as u64,
                    p_memsz: s.data.len() as u64,
                    p_align: 0x10000,
                }
            })
            .collect();

        let data_end = phdrs
            .iter()
            .map(|p| (p.p_offset + p.p_filesz) as usize)
            .max()
            .unwrap_or(ehsize + n * phsize);

        let shdrs: Vec<SectionHeader> = if self.section_headers {
            vec![
                SectionHeader::default(),
                SectionHeader {
                    sh_name: 1,
                    sh_type: 1,
                    sh_flags: 6,
                    sh_addr: phdrs.first().map_or(0, |p| p.p_vaddr),
                    sh_offset: phdrs.first().map_or(0, |p| p.p_offset),
                    sh_size: phdrs.first().map_or(0, |p| p.p_filesz),
                    sh_addralign: 4,
                    ..SectionHeader::default()
                },
            ]
        } else {
            Vec::new()
        };

        let e_shoff = if shdrs.is_empty() { 0 } else { align16(data_end) };

        let ehdr = ElfHeader {
            ident,
            e_type: 2,
            e_machine: 0x15,
            e_version: 1,
            e_entry: 0x10200,
            e_phoff: ehsize as u64,
            e_shoff: e_shoff as u64,
            e_flags: 0,
            e_ehsize: ehsize as u16,
            e_phentsize: phsize as u16,
            e_phnum: n as u16,
            e_shentsize: shsize as u16,
            e_shnum: shdrs.len() as u16,
            e_shstrndx: 0,
        };

        let ehdr_bytes = ehdr.to_bytes().unwrap();
        let phdr_bytes: Vec<u8> = phdrs
            .iter()
            .flat_map(|p| p.to_bytes(ehdr.class(), ehdr.endian()).unwrap())
            .collect();
        let shdr_bytes: Vec<u8> = shdrs
            .iter()
            .flat_map(|s| s.to_bytes(ehdr.class(), ehdr.endian()).unwrap())
            .collect();

        let mut elf = Vec::new();
        put(&mut elf, 0, &ehdr_bytes);
        put(&mut elf, ehsize, &phdr_bytes);
        for (p, s) in phdrs.iter().zip(&self.segments) {
            if !(s.encrypted && s.bad_key) {
                put(&mut elf, p.p_offset as usize, &s.data);
            }
        }
        if !shdrs.is_empty() {
            put(&mut elf, e_shoff, &shdr_bytes);
        }

        // SELF layout.
        let phdr_offset = 0xD0usize;
        let secinfo_offset = align16(phdr_offset + n * phsize);
        let version_offset = secinfo_offset + n * 0x20;
        let control_offset = version_offset + 0x10;

        let mut controls = Vec::new();
        controls.extend(be(&[&1u32, &0x30u32, &1u64]));
        controls.extend((0..8u32).flat_map(u32::to_be_bytes));
        controls.extend(be(&[&2u32, &0x40u32, &1u64]));
        controls.extend([0x11; 40]);
        controls.extend(be(&[&0u64]));
        if let Some(license) = self.license {
            controls.extend(be(&[&3u32, &0x90u32, &0u64]));
            controls.extend(be(&[&0x4E50_4400u32, &1u32, &license, &1u32]));
            let mut cid = [0u8; 48];
            cid[..CONTENT_ID.len()].copy_from_slice(CONTENT_ID.as_bytes());
            controls.extend(cid);
            controls.extend([0x22; 48]);
            controls.extend(be(&[&0u64, &0u64]));
        }

        let shdr_offset = if shdrs.is_empty() {
            0
        } else {
            align16(control_offset + controls.len())
        };
        let meta_abs = align16(control_offset + controls.len() + shdr_bytes.len());
        let headers_start = meta_abs + 0x40;
        let key_count = 2 * n;
        let header_len = headers_start + 0x20 + n * 0x30 + key_count * 16;

        // Segment payloads.
        let mut payloads = Vec::new();
        let mut next = align16(header_len);
        for (i, s) in self.segments.iter().enumerate() {
            let mut stored = if s.compressed { zlib(&s.data) } else { s.data.clone() };
            if s.truncated {
                stored.truncate(stored.len() / 2);
            }
            if s.encrypted {
                ctr_apply(&[0x40 + 2 * i as u8; 16], &[0x41 + 2 * i as u8; 16], &mut stored);
            }
            payloads.push((next, stored));
            next = align16(next + payloads[i].1.len());
        }

        // Metadata headers.
        let mut headers = be(&[
            &(meta_abs as u64),
            &0u32,
            &(n as u32),
            &(key_count as u32),
            &0u32,
            &0u32,
            &0u32,
        ]);
        for (i, (s, (offset, stored))) in self.segments.iter().zip(&payloads).enumerate() {
            let key_idx = if s.bad_key { key_count as u32 } else { 2 * i as u32 };
            headers.extend(be(&[
                &(*offset as u64),
                &(stored.len() as u64),
                &2u32,
                &(i as u32),
                &2u32,
                &0u32,
                &(if s.encrypted { 3u32 } else { 1 }),
                &key_idx,
                &(2 * i as u32 + 1),
                &(if s.compressed { 2u32 } else { 1 }),
            ]));
        }
        for i in 0..n {
            headers.extend([0x40 + 2 * i as u8; 16]);
            headers.extend([0x41 + 2 * i as u8; 16]);
        }
        ctr_apply(&META_KEY, &META_IV, &mut headers);

        let mut info = [0u8; 0x40];
        info[..16].copy_from_slice(&META_KEY);
        info[0x20..0x30].copy_from_slice(&META_IV);
        if self.flags & 0x8000 == 0 {
            cbc256_encrypt(&ERK, &RIV, &mut info);

            if let Some(license) = self.license {
                let mut key = klicensee(license);
                Aes128::new((&NP_KLIC_KEY).into())
                    .decrypt_block(GenericArray::from_mut_slice(&mut key));
                cbc128_encrypt(&key, &mut info);
            }
        }

        let data_len = next - align16(header_len);

        let mut out = Vec::new();
        put(
            &mut out,
            0,
            &be(&[
                &0x5343_4500u32,
                &2u32,
                &self.flags,
                &1u16,
                &((meta_abs - 0x20) as u32),
                &(header_len as u64),
                &(data_len as u64),
            ]),
        );
        put(
            &mut out,
            0x20,
            &be(&[
                &3u64,
                &0x70u64,
                &0x90u64,
                &(phdr_offset as u64),
                &(shdr_offset as u64),
                &(secinfo_offset as u64),
                &(version_offset as u64),
                &(control_offset as u64),
                &(controls.len() as u64),
                &0u64,
            ]),
        );
        put(
            &mut out,
            0x70,
            &be(&[
                &0x1010_0000_0100_0003u64,
                &0x0100_0002u32,
                &self.self_type.as_u32(),
                &VERSION,
                &0u64,
            ]),
        );
        put(&mut out, 0x90, &ehdr_bytes);
        put(&mut out, phdr_offset, &phdr_bytes);
        for (i, (offset, stored)) in payloads.iter().enumerate() {
            let s = &self.segments[i];
            put(
                &mut out,
                secinfo_offset + i * 0x20,
                &be(&[
                    &(*offset as u64),
                    &(stored.len() as u64),
                    &(if s.compressed { 2u32 } else { 1 }),
                    &0u32,
                    &0u32,
                    &(if s.encrypted { 1u32 } else { 2 }),
                ]),
            );
        }
        put(&mut out, version_offset, &be(&[&1u32, &0u32, &0x10u32, &0u32]));
        put(&mut out, control_offset, &controls);
        if shdr_offset != 0 {
            put(&mut out, shdr_offset, &shdr_bytes);
        }
        put(&mut out, meta_abs, &info);
        put(&mut out, headers_start, &headers);
        for (offset, stored) in &payloads {
            put(&mut out, *offset, stored);
        }

        Fixture {
            self_bytes: out,
            elf_bytes: elf,
        }
    }
}
