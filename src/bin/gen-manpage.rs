//! Writes `kflash.1` plus one page per subcommand (`kflash-flash-all.1`, ...)
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir]

use clap::CommandFactory;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[path = "../cli.rs"]
mod cli;

const SECTION: &str = "1";

fn render(cmd: clap::Command, dir: &Path, name: &str) -> io::Result<PathBuf> {
    let mut buffer = Vec::new();
    clap_mangen::Man::new(cmd)
        .section(SECTION)
        .render(&mut buffer)?;
    let path = dir.join(format!("{}.{}", name, SECTION));
    fs::write(&path, buffer)?;
    Ok(path)
}

fn main() -> io::Result<()> {
    let output_dir = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("man"));
    fs::create_dir_all(&output_dir)?;

    let bin = env!("CARGO_PKG_NAME");
    // build() fills in display names such as `kflash-flash-all`
    let mut cmd = cli::Cli::command().name(bin);
    cmd.build();

    let mut written = vec![render(cmd.clone(), &output_dir, bin)?];
    for sub in cmd.get_subcommands().filter(|s| !s.is_hide_set() && s.get_name() != "help") {
        let name = sub
            .get_display_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}", bin, sub.get_name()));
        written.push(render(sub.clone(), &output_dir, &name)?);
    }

    for path in &written {
        println!("{}", path.display());
    }
    println!(
        "{} pages written; view with `man -l {}`",
        written.len(),
        written[0].display()
    );
    Ok(())
}
