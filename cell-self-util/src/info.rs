use cell_self::container::SelfContainer;
use cell_self::control::{ControlData, FileDigest, License};
use cell_self::elf::ElfClass;
use std::io::{self, Write};
use std::path::Path;

/// Writes a human readable dump of every header of `container`.
pub fn write_info<W: Write + ?Sized>(
    out: &mut W,
    path: &Path,
    container: &SelfContainer,
) -> io::Result<()> {
    let sce = container.sce_header();
    let dir = container.self_header();
    let app = container.app_info();
    let elf = container.elf_header();

    writeln!(out, "SELF: {}", path.display())?;
    writeln!(out)?;
    writeln!(out, "SCE Header")?;
    writeln!(out, "  Version:        {}", sce.version())?;
    writeln!(out, "  Key Revision:   {}", sce.flags())?;
    writeln!(out, "  Category:       {}", sce.category())?;
    writeln!(out, "  Meta Offset:    0x{:X}", sce.meta_offset())?;
    writeln!(out, "  Header Length:  0x{:X}", sce.header_len())?;
    writeln!(out, "  Data Length:    0x{:X}", sce.data_len())?;
    writeln!(out)?;
    writeln!(out, "SELF Header")?;
    writeln!(out, "  Type:           0x{:X}", dir.header_type())?;
    writeln!(out, "  App Info:       0x{:X}", dir.app_info_offset())?;
    writeln!(out, "  ELF:            0x{:X}", dir.elf_offset())?;
    writeln!(out, "  Program Hdrs:   0x{:X}", dir.phdr_offset())?;
    writeln!(out, "  Section Hdrs:   0x{:X}", dir.shdr_offset())?;
    writeln!(out, "  Section Info:   0x{:X}", dir.section_info_offset())?;
    writeln!(out, "  Version Info:   0x{:X}", dir.version_info_offset())?;
    writeln!(
        out,
        "  Control Info:   0x{:X} ({} bytes)",
        dir.control_offset(),
        dir.control_size()
    )?;
    writeln!(out)?;
    writeln!(out, "Application Info")?;
    writeln!(out, "  Auth ID:        0x{:016X}", app.auth_id())?;
    writeln!(out, "  Vendor ID:      0x{:08X}", app.vendor_id())?;
    writeln!(out, "  Type:           {}", app.self_type())?;
    writeln!(out, "  Version:        0x{:016X}", app.version())?;
    writeln!(out)?;
    writeln!(out, "ELF Header")?;
    writeln!(
        out,
        "  Class:          {}",
        match elf.class() {
            ElfClass::Elf32 => "ELF32",
            ElfClass::Elf64 => "ELF64",
        }
    )?;
    writeln!(out, "  Type:           0x{:04X}", elf.e_type)?;
    writeln!(out, "  Machine:        0x{:04X}", elf.e_machine)?;
    writeln!(out, "  Entry:          0x{:X}", elf.e_entry)?;
    writeln!(out, "  Program Hdrs:   {} at 0x{:X}", elf.e_phnum, elf.e_phoff)?;
    writeln!(out, "  Section Hdrs:   {} at 0x{:X}", elf.e_shnum, elf.e_shoff)?;
    writeln!(out, "  Flags:          0x{:08X}", elf.e_flags)?;

    writeln!(out)?;
    writeln!(out, "Program Headers")?;
    writeln!(
        out,
        "{:>4}  {:>10}  {:>10}  {:>18}  {:>10}  {:>10}  {:>5}",
        "#", "Type", "Offset", "VAddr", "FileSz", "MemSz", "Flags"
    )?;

    for (i, p) in container.program_headers().iter().enumerate() {
        writeln!(
            out,
            "{:>4}  0x{:08X}  0x{:08X}  0x{:016X}  0x{:08X}  0x{:08X}  {:>5X}",
            i, p.p_type, p.p_offset, p.p_vaddr, p.p_filesz, p.p_memsz, p.p_flags
        )?;
    }

    writeln!(out)?;
    writeln!(out, "Section Info")?;
    writeln!(
        out,
        "{:>4}  {:>10}  {:>10}  {:>10}  {:>9}",
        "#", "Offset", "Size", "Compressed", "Encrypted"
    )?;

    for (i, s) in container.section_infos().iter().enumerate() {
        writeln!(
            out,
            "{:>4}  0x{:08X}  0x{:08X}  {:>10}  {:>9}",
            i,
            s.offset(),
            s.size(),
            s.compressed() == 2,
            s.encrypted() == 1
        )?;
    }

    let version = container.version_info();

    writeln!(out)?;
    writeln!(out, "Version Info")?;
    writeln!(out, "  Subheader Type: {}", version.subheader_type())?;
    writeln!(out, "  Present:        {}", version.present())?;
    writeln!(out, "  Size:           0x{:X}", version.size())?;

    writeln!(out)?;
    writeln!(out, "Control Info")?;

    for control in container.controls() {
        match control.data() {
            ControlData::Flags(flags) => {
                let flags: Vec<String> = flags.iter().map(|v| format!("{v:08X}")).collect();
                writeln!(out, "  Flags:          {}", flags.join(" "))?;
            }
            ControlData::FileDigest(FileDigest::Single { digest, .. }) => {
                writeln!(out, "  Digest:         {}", hex::encode_upper(digest))?;
            }
            ControlData::FileDigest(FileDigest::Double {
                digest1, digest2, ..
            }) => {
                writeln!(out, "  Digest 1:       {}", hex::encode_upper(digest1))?;
                writeln!(out, "  Digest 2:       {}", hex::encode_upper(digest2))?;
            }
            ControlData::Npdrm(npdrm) => {
                let license = match npdrm.license() {
                    License::Network => "network".to_owned(),
                    License::Local => "local".to_owned(),
                    License::Free => "free".to_owned(),
                    License::Unknown(v) => format!("unknown ({v})"),
                };

                writeln!(out, "  Content ID:     {}", npdrm.content_id())?;
                writeln!(out, "  License:        {license}")?;
                writeln!(out, "  App Type:       0x{:X}", npdrm.app_type())?;
                writeln!(out, "  Digest:         {}", hex::encode_upper(npdrm.digest()))?;
            }
        }
    }

    if !container.section_headers().is_empty() {
        writeln!(out)?;
        writeln!(out, "Section Headers")?;
        writeln!(
            out,
            "{:>4}  {:>10}  {:>10}  {:>18}  {:>10}  {:>10}",
            "#", "Name", "Type", "Addr", "Offset", "Size"
        )?;

        for (i, s) in container.section_headers().iter().enumerate() {
            writeln!(
                out,
                "{:>4}  0x{:08X}  0x{:08X}  0x{:016X}  0x{:08X}  0x{:08X}",
                i, s.sh_name, s.sh_type, s.sh_addr, s.sh_offset, s.sh_size
            )?;
        }
    }

    Ok(())
}
