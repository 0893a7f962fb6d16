//! `stencil run` and `stencil show`: resolve a single template.

use std::io::Write;

use stencil_cache::{Env, ResolveError, ResolveKind};

use crate::host::with_host;
use crate::{GlobalArgs, ReportFormat, RunArgs, ShowArgs, EXIT_ABSENT, EXIT_OK};

/// Runs the `stencil run` command.
///
/// Writes the template output to stdout. Returns exit code 0 on success and
/// 2 if the template does not exist.
pub fn run(args: &RunArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let env: Env = args.env.iter().cloned().collect();
    with_host(global, |host| match host.resolve_and_execute(&args.name, &env) {
        Ok(output) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&output)?;
            stdout.flush()?;
            Ok(EXIT_OK)
        }
        Err(e) => absent_or(e, global),
    })
}

/// Runs the `stencil show` command.
///
/// Prints the name, compiler, source hash, and size of the compiled
/// template.
pub fn show(args: &ShowArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    with_host(global, |host| {
        let artifact = match host.resolve(&args.name) {
            Ok(artifact) => artifact,
            Err(e) => return absent_or(e, global),
        };
        match args.format {
            ReportFormat::Text => {
                println!("name:     {}", artifact.name);
                println!("compiler: {}", artifact.compiler);
                println!("source:   {}", artifact.source_hash);
                println!("size:     {} bytes", artifact.size());
            }
            ReportFormat::Json => {
                let json = serde_json::json!({
                    "name": artifact.name,
                    "compiler": artifact.compiler,
                    "source_hash": artifact.source_hash.to_string(),
                    "size": artifact.size(),
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
        }
        Ok(EXIT_OK)
    })
}

/// Maps "not found" to exit code 2 and propagates every other failure.
fn absent_or(err: ResolveError, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    if err.kind() == ResolveKind::NotFound {
        if !global.quiet {
            eprintln!("{err}");
        }
        return Ok(EXIT_ABSENT);
    }
    Err(err.into())
}
