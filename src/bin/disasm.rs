//! Program-image disassembler CLI.
//!
//! Reads a serialized program image and prints one instruction per line.
//!
//! # Usage
//! ```text
//! disasm <image.atbc>
//! ```

use atvm::assembler::disassemble;
use atvm::program::ProgramImage;
use std::env;
use std::fs;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 || args[1] == "--help" || args[1] == "-h" {
        eprintln!("Usage: {} <image.atbc>", args[0]);
        process::exit(if args.len() != 2 { 1 } else { 0 });
    }

    let bytes = match fs::read(&args[1]) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Cannot read {}: {e}", args[1]);
            process::exit(1);
        }
    };

    let image = match ProgramImage::from_bytes(&bytes) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("Invalid program image: {e}");
            process::exit(1);
        }
    };

    match disassemble(&image.code) {
        Ok(listing) => print!("{listing}"),
        Err(e) => {
            eprintln!("Disassembly failed: {e}");
            process::exit(1);
        }
    }
}
