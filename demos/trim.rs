//! Trims whitespace from every `src/**/*.txt` into `build/**/*.nospace`.
//!
//! Run from a directory containing a `src/` tree:
//!
//! ```text
//! cargo run --example trim
//! ```

use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8Path;
use kamado::{build, run_build, BuildTask};

fn main() -> ExitCode {
    let trim = build(
        |ctx| {
            for source in &ctx.sources {
                let text = fs::read_to_string(source)?;
                fs::write(ctx.output_file(source), text.trim())?;
            }
            Ok(())
        },
        "src",
        ".txt",
        "build",
        ".nospace",
    );

    let tasks: Vec<Arc<dyn BuildTask>> = vec![trim];
    match run_build(&tasks, &mut std::io::stdout(), Utf8Path::new(".")) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}
