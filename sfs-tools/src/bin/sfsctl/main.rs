mod cli;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use fileblock::{FileBlockEmulator, FileBlockEmulatorBuilder};
use log::info;
use simplefs::alloc::Bitmap;
use simplefs::fs::{BLOCK_SECTORS, BLOCK_SIZE, MAX_VOLUME_BLOCKS};
use simplefs::{FileType, SFSError, SFS};

fn mount(image: &Path) -> Result<SFS<FileBlockEmulator>> {
    let dev = FileBlockEmulator::open(image).with_context(|| format!("cannot open {}", image.display()))?;
    SFS::open(dev).with_context(|| format!("{} is not a simplefs volume", image.display()))
}

fn format(image: &Path, blocks: u32) -> Result<()> {
    // Refuse before the image is truncated.
    if blocks > MAX_VOLUME_BLOCKS || blocks <= Bitmap::new(blocks).first_data_block() {
        bail!("cannot format a volume of {} blocks", blocks);
    }
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image)
        .with_context(|| format!("cannot create {}", image.display()))?;
    let dev = FileBlockEmulatorBuilder::from(fd)
        .with_sector_count(u64::from(blocks) * BLOCK_SECTORS as u64)
        .build()?;
    let mut fs = SFS::format(dev, blocks)?;
    let info = fs.info()?;
    println!(
        "formatted {}: {} blocks, {} free",
        image.display(),
        info.total_blocks,
        info.total_blocks - info.used_blocks
    );
    Ok(())
}

fn ls(fs: &mut SFS<FileBlockEmulator>, path: &str) -> Result<()> {
    let f = fs.open_file(path)?;
    let entries = if fs.stat(f)?.is_dir { fs.dir_files(f)? } else { vec![f] };
    for entry in entries {
        let st = fs.stat(entry)?;
        let kind = if st.is_dir { 'd' } else { '-' };
        println!("{} {:>10} {}", kind, st.size, st.name);
    }
    Ok(())
}

fn cat(fs: &mut SFS<FileBlockEmulator>, path: &str) -> Result<()> {
    let f = fs.open_file(path)?;
    if fs.stat(f)?.is_dir {
        bail!("{} is a directory", path);
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0; BLOCK_SIZE];
    let mut offset = 0;
    loop {
        let n = fs.read(f, &mut buf, offset)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        offset += n as i64;
    }
    out.flush()?;
    Ok(())
}

fn rm(fs: &mut SFS<FileBlockEmulator>, path: &str, recursive: bool) -> Result<()> {
    let f = fs.open_file(path)?;
    if fs.stat(f)?.is_dir && !recursive {
        bail!("{} is a directory, pass --recursive to remove it", path);
    }
    fs.remove_tree(f)?;
    info!("removed {}", path);
    Ok(())
}

fn touch(fs: &mut SFS<FileBlockEmulator>, path: &str) -> Result<()> {
    match fs.create_file(path, FileType::RegularFile) {
        Ok(_) | Err(SFSError::FileExists) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("cannot create {}", path)),
    }
}

fn mv(fs: &mut SFS<FileBlockEmulator>, src: &str, dst_dir: &str) -> Result<()> {
    let f = fs.open_file(src).with_context(|| format!("cannot find {}", src))?;
    let dir = fs.open_file(dst_dir).with_context(|| format!("cannot find {}", dst_dir))?;
    if !fs.stat(dir)?.is_dir {
        bail!("{} is not a directory", dst_dir);
    }
    fs.rename(dir, f)
        .with_context(|| format!("cannot move {} into {}", src, dst_dir))?;
    info!("moved {} into {}", src, dst_dir);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let image = cli.image.as_path();

    match cli.command {
        Command::Format { blocks } => return format(image, blocks),
        Command::Info => {
            let info = mount(image)?.info()?;
            println!("blocks: {}", info.total_blocks);
            println!("used:   {}", info.used_blocks);
            println!("free:   {}", info.total_blocks - info.used_blocks);
            return Ok(());
        }
        Command::Ls { path } => ls(&mut mount(image)?, &path)?,
        Command::Cat { path } => cat(&mut mount(image)?, &path)?,
        Command::Mkdir { path } => {
            let mut fs = mount(image)?;
            fs.create_file(&path, FileType::Directory)
                .with_context(|| format!("cannot create {}", path))?;
            fs.sync()?;
        }
        Command::Touch { path } => {
            let mut fs = mount(image)?;
            touch(&mut fs, &path)?;
            fs.sync()?;
        }
        Command::Mv { src, dst_dir } => {
            let mut fs = mount(image)?;
            mv(&mut fs, &src, &dst_dir)?;
            fs.sync()?;
        }
        Command::Rm { path, recursive } => {
            let mut fs = mount(image)?;
            rm(&mut fs, &path, recursive)?;
            fs.sync()?;
        }
    }
    Ok(())
}
