//! Configuration module.
//!
//! This module defines the command-line interface using `clap` and turns it into
//! the options the pipeline consumes. Nothing else reads the command line.

use clap::Parser;
use std::path::{Path, PathBuf};

use crate::compiler::{CompileOptions, Directive, Selector};
use crate::vm::profile::{ManagedDispatch, VmProfile};

/// Protects x86, x86-64 and CIL functions of PE, ELF and Mach-O executables by
/// translating them into bytecode for an embedded virtual machine.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input executable
    pub input: PathBuf,

    /// Output file (default: <input stem>.protected<.ext> next to the input)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Function to virtualize, by name or 0x-prefixed entry address
    #[arg(short, long = "virtualize", value_name = "NAME|0xADDR")]
    pub virtualize: Vec<Selector>,

    /// Name of the appended VM segment
    #[arg(long, default_value = ".uvm0")]
    pub section_name: String,

    /// Seed of the opcode permutation
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Only materialize flags that a later instruction reads
    #[arg(long)]
    pub optimize_flags: bool,

    /// Text signed into the VM segment
    #[arg(long)]
    pub watermark: Option<String>,

    /// Managed VM dispatch method for one signature shape, e.g. `i4,i4->i4=0x06000002`
    #[arg(long, value_name = "SHAPE=HEX", value_parser = parse_dispatch, allow_hyphen_values = true)]
    pub managed_dispatch: Vec<ManagedDispatch>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

fn parse_token(s: &str) -> Result<u32, String> {
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(hex, 16).map_err(|e| format!("invalid token `{s}`: {e}"))
}

fn parse_dispatch(s: &str) -> Result<ManagedDispatch, String> {
    let (shape, token) = s.rsplit_once('=').ok_or_else(|| format!("`{s}` is not SHAPE=TOKEN"))?;
    Ok(ManagedDispatch {
        shape: shape.parse()?,
        token: parse_token(token)?,
    })
}

impl Config {
    /// The output path, defaulting to `<stem>.protected<.ext>` beside the input.
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| default_output(&self.input))
    }

    pub fn compile_options(&self) -> CompileOptions {
        let directives = self.virtualize.iter().cloned().map(Directive::virtualize).collect();
        CompileOptions {
            section_name: self.section_name.clone(),
            watermark: self.watermark.clone(),
            directives,
        }
    }

    pub fn profile(&self) -> VmProfile {
        let mut profile = VmProfile::new(self.seed);
        profile.optimize_flags = self.optimize_flags;
        profile.managed_dispatch = self.managed_dispatch.clone();
        profile
    }
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{stem}.protected.{}", ext.to_string_lossy()),
        None => format!("{stem}.protected"),
    };
    input.with_file_name(name)
}
