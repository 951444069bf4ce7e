//! Command-line front end: `mount`, `ls`, `cat`, `scan`, `put`, `rm`,
//! `mkdir` over whichever format the image is opened as (spec §1's
//! "command-line front-end" non-goal, built as thin glue around the
//! library the way `hadris-iso-cli`/`hadris-fat-cli` sit around
//! `hadris-iso`/`hadris-fat`).
//!
//! The whole image is read into memory and, for a mutating command,
//! written back afterward — the same "bytes in, bytes out" shape
//! `hadris-cli`'s own `main.rs` uses.

use std::cell::RefCell;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use clap::{Parser, Subcommand, ValueEnum};
use paleofs_core::descriptor::{FileDescriptor, ForkStorage, Mode};
use paleofs_core::MemoryDevice;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Hfs,
    Prodos,
    Cpm,
    Pascal,
}

#[derive(Debug, Parser)]
#[command(name = "paleofs", about = "Inspect and edit vintage disk images")]
struct Cli {
    /// Path to the disk image.
    image: PathBuf,

    #[arg(long, value_enum)]
    format: Format,

    /// Increase log verbosity (equivalent to `RUST_LOG=paleofs=debug`).
    #[arg(short, long)]
    verbose: bool,

    /// CP/M only: allocation blocks reserved for the directory.
    #[arg(long, default_value_t = 2)]
    cpm_dir_alloc_blocks: u32,

    /// CP/M only: total allocation blocks on the disk.
    #[arg(long, default_value_t = 0)]
    cpm_total_alloc_blocks: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Mount the image and print volume notes.
    Mount,
    /// List the entries at the volume root.
    Ls,
    /// Print a file's data fork to stdout.
    Cat { name: String },
    /// Rebuild the volume usage map and report conflicts.
    Scan,
    /// Write a host file into the image as a new entry.
    Put { name: String, source: PathBuf },
    /// Delete an entry.
    Rm { name: String },
    /// Create a subdirectory (HFS/ProDOS only — CP/M and UCSD Pascal have
    /// a flat namespace).
    Mkdir { name: String },
}

impl Command {
    fn mutates(&self) -> bool {
        matches!(self, Command::Put { .. } | Command::Rm { .. } | Command::Mkdir { .. })
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "paleofs=debug,info" } else { "paleofs=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let bytes = std::fs::read(&cli.image)?;

    match cli.format {
        Format::Hfs => {
            if cli.command.mutates() || matches!(cli.command, Command::Cat { .. }) {
                anyhow::bail!(
                    "the CLI doesn't yet expose HFS's entry/location lookup needed for cat/put/rm/mkdir \
                     (list_children only returns names, not the EntryId open_fork needs)"
                );
            }
            run_hfs(MemoryDevice::new(bytes), &cli.command)?;
        }
        Format::Prodos => {
            if cli.command.mutates() || matches!(cli.command, Command::Cat { .. }) {
                anyhow::bail!(
                    "the CLI doesn't yet expose ProDOS's directory-location lookup needed for cat/put/rm/mkdir \
                     (list_children discards the EntryLocation open_fork needs)"
                );
            }
            run_prodos(MemoryDevice::new(bytes), &cli.command)?;
        }
        Format::Cpm => {
            let device = Rc::new(RefCell::new(MemoryDevice::new(bytes)));
            let wrote = run_cpm(device.clone(), &cli.command, &cli)?;
            if wrote {
                std::fs::write(&cli.image, device.borrow().as_slice())?;
            }
        }
        Format::Pascal => {
            let device = Rc::new(RefCell::new(MemoryDevice::new(bytes)));
            let wrote = run_pascal(device.clone(), &cli.command)?;
            if wrote {
                std::fs::write(&cli.image, device.borrow().as_slice())?;
            }
        }
    }
    Ok(())
}

fn run_hfs(device: MemoryDevice, command: &Command) -> anyhow::Result<()> {
    use paleofs_hfs::{HfsVolume, ROOT_DIR_ID};

    let mut vol = HfsVolume::mount(device, true)?;
    match command {
        Command::Mount => print_notes(vol.notes()),
        Command::Ls => {
            for (name, _) in vol.list_children(ROOT_DIR_ID)? {
                println!("{name}");
            }
        }
        Command::Scan => report_scan(vol.scan_and_verify()?),
        _ => unreachable!("mutating/cat commands are rejected before mount"),
    }
    Ok(())
}

fn run_prodos(device: MemoryDevice, command: &Command) -> anyhow::Result<()> {
    use paleofs_prodos::directory::VOLUME_DIR_BLOCK;
    use paleofs_prodos::ProdosVolume;

    let mut vol = ProdosVolume::mount(device, true)?;
    match command {
        Command::Mount => print_notes(vol.notes()),
        Command::Ls => {
            for (name, entry) in vol.list_children(VOLUME_DIR_BLOCK)? {
                println!("{name}{}", if entry.storage_type.is_directory_like() { "/" } else { "" });
            }
        }
        Command::Scan => report_scan(vol.scan_and_verify()?),
        _ => unreachable!("mutating/cat commands are rejected before mount"),
    }
    Ok(())
}

fn run_cpm(device: Rc<RefCell<MemoryDevice>>, command: &Command, cli: &Cli) -> anyhow::Result<bool> {
    use paleofs_cpm::{CpmVolume, DiskParams};

    let params = DiskParams {
        dir_alloc_blocks: cli.cpm_dir_alloc_blocks,
        total_alloc_blocks: cli.cpm_total_alloc_blocks,
    };
    let read_only = !command.mutates();
    let mut vol = CpmVolume::mount(device, params, read_only)?;

    let mut wrote = false;
    match command {
        Command::Mount => print_notes(vol.notes()),
        Command::Ls => {
            for (_, name) in vol.list_files() {
                println!("{name}");
            }
        }
        Command::Scan => report_scan(vol.scan_and_verify()?),
        Command::Cat { name } => {
            let entry = find_named(vol.list_files(), name)?;
            let mut fd = vol.open_fork(entry, Mode::ReadOnly)?;
            let buf = read_whole_fork(&mut fd)?;
            std::io::stdout().write_all(&buf)?;
            fd.invalidate();
            vol.release_fork(entry, Mode::ReadOnly);
        }
        Command::Put { name, source } => {
            let data = std::fs::read(source)?;
            let entry = vol.create_file(0, name)?;
            let mut fd = vol.open_fork(entry, Mode::ReadWrite)?;
            write_whole_fork(&mut fd, &data)?;
            fd.flush()?;
            fd.invalidate();
            vol.release_fork(entry, Mode::ReadWrite);
            wrote = true;
        }
        Command::Rm { name } => {
            let entry = find_named(vol.list_files(), name)?;
            vol.delete_file(entry)?;
            wrote = true;
        }
        Command::Mkdir { .. } => anyhow::bail!("CP/M has no subdirectories"),
    }
    Ok(wrote)
}

fn run_pascal(device: Rc<RefCell<MemoryDevice>>, command: &Command) -> anyhow::Result<bool> {
    use paleofs_pascal::{FileKind, PascalVolume};

    let read_only = !command.mutates();
    let mut vol = PascalVolume::mount(device, read_only)?;

    let mut wrote = false;
    match command {
        Command::Mount => print_notes(vol.notes()),
        Command::Ls => {
            for (_, name) in vol.list_files() {
                println!("{name}");
            }
        }
        Command::Scan => report_scan(vol.scan_and_verify()?),
        Command::Cat { name } => {
            let entry = find_named(vol.list_files(), name)?;
            let mut fd = vol.open_fork(entry, Mode::ReadOnly)?;
            let buf = read_whole_fork(&mut fd)?;
            std::io::stdout().write_all(&buf)?;
            fd.invalidate();
            vol.release_fork(entry, Mode::ReadOnly);
        }
        Command::Put { name, source } => {
            let data = std::fs::read(source)?;
            let blocks = (data.len() as u32).div_ceil(512).max(1);
            let entry = vol.create_file(name, FileKind::Data, blocks)?;
            let mut fd = vol.open_fork(entry, Mode::ReadWrite)?;
            write_whole_fork(&mut fd, &data)?;
            fd.flush()?;
            fd.invalidate();
            vol.release_fork(entry, Mode::ReadWrite);
            wrote = true;
        }
        Command::Rm { name } => {
            let entry = find_named(vol.list_files(), name)?;
            vol.delete_file(entry)?;
            wrote = true;
        }
        Command::Mkdir { .. } => anyhow::bail!("UCSD Pascal has no subdirectories"),
    }
    Ok(wrote)
}

fn read_whole_fork<S: ForkStorage>(fd: &mut FileDescriptor<S>) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; fd.eof() as usize];
    let mut done = 0;
    while done < buf.len() {
        let n = fd.read(&mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    buf.truncate(done);
    Ok(buf)
}

fn write_whole_fork<S: ForkStorage>(fd: &mut FileDescriptor<S>, data: &[u8]) -> anyhow::Result<()> {
    let mut done = 0;
    while done < data.len() {
        done += fd.write(&data[done..])?;
    }
    Ok(())
}

fn find_named(
    files: Vec<(paleofs_core::arena::EntryId, String)>,
    name: &str,
) -> anyhow::Result<paleofs_core::arena::EntryId> {
    files
        .into_iter()
        .find(|(_, n)| n == name)
        .map(|(id, _)| id)
        .ok_or_else(|| anyhow::anyhow!("no entry named {name}"))
}

fn print_notes(notes: &paleofs_core::notes::Notes) {
    for note in notes.iter() {
        println!("[{:?}] {}", note.severity, note.message);
    }
}

fn report_scan(usage: paleofs_core::usage::VolumeUsageMap) {
    println!("{} chunks tracked, {} conflicts", usage.num_chunks(), usage.conflicts().len());
    for conflict in usage.conflicts() {
        println!("  conflict at chunk {:?}", conflict);
    }
}
