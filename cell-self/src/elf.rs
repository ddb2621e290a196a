//! ELF file, program and section headers.
//!
//! Headers are held as width-independent values and encoded back in the
//! class and byte order recorded in `e_ident`.

use std::io::{self, ErrorKind, Read, Write};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use snafu::{Snafu, ensure};

pub const ELF_MAGIC: [u8; 4] = *b"\x7FELF";

pub const EI_NIDENT: usize = 16;
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;

pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;

/// Errors when reading ELF headers.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("data too small for ELF {what}"))]
    TooSmall { what: &'static str },

    #[snafu(display("invalid ELF magic"))]
    InvalidMagic,

    #[snafu(display("i/o failed while reading ELF {what}"))]
    IoFailed {
        what: &'static str,
        source: io::Error,
    },
}

type Result<T, E = ReadError> = std::result::Result<T, E>;

fn map_io(what: &'static str) -> impl FnOnce(io::Error) -> ReadError {
    move |e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            ReadError::TooSmall { what }
        } else {
            ReadError::IoFailed { what, source: e }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

fn read_word<B: ByteOrder, R: Read + ?Sized>(r: &mut R, class: ElfClass) -> io::Result<u64> {
    match class {
        ElfClass::Elf32 => r.read_u32::<B>().map(u64::from),
        ElfClass::Elf64 => r.read_u64::<B>(),
    }
}

fn write_word<B: ByteOrder, W: Write + ?Sized>(w: &mut W, class: ElfClass, v: u64) -> io::Result<()> {
    match class {
        ElfClass::Elf32 => {
            let v = u32::try_from(v).map_err(|_| {
                io::Error::new(ErrorKind::InvalidInput, "value does not fit in an ELF32 field")
            })?;
            w.write_u32::<B>(v)
        }
        ElfClass::Elf64 => w.write_u64::<B>(v),
    }
}

/// ELF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub ident: [u8; EI_NIDENT],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl ElfHeader {
    /// Parses the header from the start of `data`.
    pub fn read(data: &[u8]) -> Result<Self> {
        Self::read_from(&mut &data[..])
    }

    /// Reads the header from the current position of `reader`.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut ident = [0u8; EI_NIDENT];

        reader.read_exact(&mut ident).map_err(map_io("header"))?;

        ensure!(ident[..4] == ELF_MAGIC, InvalidMagicSnafu);

        let hdr = match endian_of(&ident) {
            Endian::Little => Self::read_rest::<LittleEndian, R>(reader, ident),
            Endian::Big => Self::read_rest::<BigEndian, R>(reader, ident),
        };

        hdr.map_err(map_io("header"))
    }

    fn read_rest<B: ByteOrder, R: Read + ?Sized>(
        r: &mut R,
        ident: [u8; EI_NIDENT],
    ) -> io::Result<Self> {
        let class = class_of(&ident);

        Ok(Self {
            ident,
            e_type: r.read_u16::<B>()?,
            e_machine: r.read_u16::<B>()?,
            e_version: r.read_u32::<B>()?,
            e_entry: read_word::<B, _>(r, class)?,
            e_phoff: read_word::<B, _>(r, class)?,
            e_shoff: read_word::<B, _>(r, class)?,
            e_flags: r.read_u32::<B>()?,
            e_ehsize: r.read_u16::<B>()?,
            e_phentsize: r.read_u16::<B>()?,
            e_phnum: r.read_u16::<B>()?,
            e_shentsize: r.read_u16::<B>()?,
            e_shnum: r.read_u16::<B>()?,
            e_shstrndx: r.read_u16::<B>()?,
        })
    }

    /// Writes the header in its own class and byte order.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        match self.endian() {
            Endian::Little => self.write_as::<LittleEndian, W>(writer),
            Endian::Big => self.write_as::<BigEndian, W>(writer),
        }
    }

    fn write_as<B: ByteOrder, W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        let class = self.class();

        w.write_all(&self.ident)?;
        w.write_u16::<B>(self.e_type)?;
        w.write_u16::<B>(self.e_machine)?;
        w.write_u32::<B>(self.e_version)?;
        write_word::<B, _>(w, class, self.e_entry)?;
        write_word::<B, _>(w, class, self.e_phoff)?;
        write_word::<B, _>(w, class, self.e_shoff)?;
        w.write_u32::<B>(self.e_flags)?;
        w.write_u16::<B>(self.e_ehsize)?;
        w.write_u16::<B>(self.e_phentsize)?;
        w.write_u16::<B>(self.e_phnum)?;
        w.write_u16::<B>(self.e_shentsize)?;
        w.write_u16::<B>(self.e_shnum)?;
        w.write_u16::<B>(self.e_shstrndx)
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::size(self.class()));
        self.write_to(&mut out)?;
        Ok(out)
    }

    #[must_use]
    pub fn class(&self) -> ElfClass {
        class_of(&self.ident)
    }

    #[must_use]
    pub fn endian(&self) -> Endian {
        endian_of(&self.ident)
    }

    /// Encoded size of the file header for `class`.
    #[must_use]
    pub const fn size(class: ElfClass) -> usize {
        match class {
            ElfClass::Elf32 => 0x34,
            ElfClass::Elf64 => 0x40,
        }
    }
}

fn class_of(ident: &[u8; EI_NIDENT]) -> ElfClass {
    if ident[EI_CLASS] == ELFCLASS32 {
        ElfClass::Elf32
    } else {
        ElfClass::Elf64
    }
}

fn endian_of(ident: &[u8; EI_NIDENT]) -> Endian {
    if ident[EI_DATA] == ELFDATA2LSB {
        Endian::Little
    } else {
        Endian::Big
    }
}

/// ELF program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl ProgramHeader {
    pub fn read(data: &[u8], class: ElfClass, endian: Endian) -> Result<Self> {
        Self::read_from(&mut &data[..], class, endian)
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R, class: ElfClass, endian: Endian) -> Result<Self> {
        let hdr = match endian {
            Endian::Little => Self::read_as::<LittleEndian, R>(reader, class),
            Endian::Big => Self::read_as::<BigEndian, R>(reader, class),
        };

        hdr.map_err(map_io("program header"))
    }

    fn read_as<B: ByteOrder, R: Read + ?Sized>(r: &mut R, class: ElfClass) -> io::Result<Self> {
        // The flags field moves between the two layouts.
        Ok(match class {
            ElfClass::Elf32 => {
                let p_type = r.read_u32::<B>()?;
                let p_offset = r.read_u32::<B>()?.into();
                let p_vaddr = r.read_u32::<B>()?.into();
                let p_paddr = r.read_u32::<B>()?.into();
                let p_filesz = r.read_u32::<B>()?.into();
                let p_memsz = r.read_u32::<B>()?.into();
                let p_flags = r.read_u32::<B>()?;
                let p_align = r.read_u32::<B>()?.into();

                Self {
                    p_type,
                    p_flags,
                    p_offset,
                    p_vaddr,
                    p_paddr,
                    p_filesz,
                    p_memsz,
                    p_align,
                }
            }
            ElfClass::Elf64 => Self {
                p_type: r.read_u32::<B>()?,
                p_flags: r.read_u32::<B>()?,
                p_offset: r.read_u64::<B>()?,
                p_vaddr: r.read_u64::<B>()?,
                p_paddr: r.read_u64::<B>()?,
                p_filesz: r.read_u64::<B>()?,
                p_memsz: r.read_u64::<B>()?,
                p_align: r.read_u64::<B>()?,
            },
        })
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W, class: ElfClass, endian: Endian) -> io::Result<()> {
        match endian {
            Endian::Little => self.write_as::<LittleEndian, W>(writer, class),
            Endian::Big => self.write_as::<BigEndian, W>(writer, class),
        }
    }

    fn write_as<B: ByteOrder, W: Write + ?Sized>(&self, w: &mut W, class: ElfClass) -> io::Result<()> {
        w.write_u32::<B>(self.p_type)?;

        if class == ElfClass::Elf64 {
            w.write_u32::<B>(self.p_flags)?;
        }

        write_word::<B, _>(w, class, self.p_offset)?;
        write_word::<B, _>(w, class, self.p_vaddr)?;
        write_word::<B, _>(w, class, self.p_paddr)?;
        write_word::<B, _>(w, class, self.p_filesz)?;
        write_word::<B, _>(w, class, self.p_memsz)?;

        if class == ElfClass::Elf32 {
            w.write_u32::<B>(self.p_flags)?;
        }

        write_word::<B, _>(w, class, self.p_align)
    }

    pub fn to_bytes(&self, class: ElfClass, endian: Endian) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::size(class));
        self.write_to(&mut out, class, endian)?;
        Ok(out)
    }

    #[must_use]
    pub const fn size(class: ElfClass) -> usize {
        match class {
            ElfClass::Elf32 => 0x20,
            ElfClass::Elf64 => 0x38,
        }
    }
}

/// ELF section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl SectionHeader {
    pub fn read(data: &[u8], class: ElfClass, endian: Endian) -> Result<Self> {
        Self::read_from(&mut &data[..], class, endian)
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R, class: ElfClass, endian: Endian) -> Result<Self> {
        let hdr = match endian {
            Endian::Little => Self::read_as::<LittleEndian, R>(reader, class),
            Endian::Big => Self::read_as::<BigEndian, R>(reader, class),
        };

        hdr.map_err(map_io("section header"))
    }

    fn read_as<B: ByteOrder, R: Read + ?Sized>(r: &mut R, class: ElfClass) -> io::Result<Self> {
        Ok(Self {
            sh_name: r.read_u32::<B>()?,
            sh_type: r.read_u32::<B>()?,
            sh_flags: read_word::<B, _>(r, class)?,
            sh_addr: read_word::<B, _>(r, class)?,
            sh_offset: read_word::<B, _>(r, class)?,
            sh_size: read_word::<B, _>(r, class)?,
            sh_link: r.read_u32::<B>()?,
            sh_info: r.read_u32::<B>()?,
            sh_addralign: read_word::<B, _>(r, class)?,
            sh_entsize: read_word::<B, _>(r, class)?,
        })
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W, class: ElfClass, endian: Endian) -> io::Result<()> {
        match endian {
            Endian::Little => self.write_as::<LittleEndian, W>(writer, class),
            Endian::Big => self.write_as::<BigEndian, W>(writer, class),
        }
    }

    fn write_as<B: ByteOrder, W: Write + ?Sized>(&self, w: &mut W, class: ElfClass) -> io::Result<()> {
        w.write_u32::<B>(self.sh_name)?;
        w.write_u32::<B>(self.sh_type)?;
        write_word::<B, _>(w, class, self.sh_flags)?;
        write_word::<B, _>(w, class, self.sh_addr)?;
        write_word::<B, _>(w, class, self.sh_offset)?;
        write_word::<B, _>(w, class, self.sh_size)?;
        w.write_u32::<B>(self.sh_link)?;
        w.write_u32::<B>(self.sh_info)?;
        write_word::<B, _>(w, class, self.sh_addralign)?;
        write_word::<B, _>(w, class, self.sh_entsize)
    }

    pub fn to_bytes(&self, class: ElfClass, endian: Endian) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::size(class));
        self.write_to(&mut out, class, endian)?;
        Ok(out)
    }

    #[must_use]
    pub const fn size(class: ElfClass) -> usize {
        match class {
            ElfClass::Elf32 => 0x28,
            ElfClass::Elf64 => 0x40,
        }
    }
}
