use std::ops::ControlFlow;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tsumiki::{EngineError, ExecContext, Pie, ResourceStamper, Task, TaskFailure};

/// This example counts the words of every `.txt` file in a directory.
///
/// Topology:
///          [Directory]
///         /     |     \
///    [File]  [File]  [File]
///
/// The directory task depends on the listing of the directory, so adding or
/// removing a file re-runs it, while editing a file only re-runs the task for
/// that one file (and the directory task, since the total changed).
///
/// Results are kept in `.tsumiki/`; run the example twice and the second run
/// executes nothing.
///
/// Usage:
///   cargo run --example word_count --features logging -- <dir> [--watch]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum Count {
    Directory(Utf8PathBuf),
    File(Utf8PathBuf),
}

impl Task for Count {
    type Output = Result<usize, TaskFailure>;

    fn id(&self) -> &'static str {
        match self {
            Count::Directory(_) => "directory",
            Count::File(_) => "file",
        }
    }

    fn execute(&self, ctx: &mut ExecContext<Self>) -> Result<Self::Output, EngineError> {
        match self {
            Count::Directory(dir) => {
                ctx.require_resource(dir, ResourceStamper::Listing)?;

                let mut files = match list_text_files(dir) {
                    Ok(files) => files,
                    Err(e) => return Ok(Err(e.into())),
                };
                files.sort();

                let mut total = 0;
                for file in files {
                    match ctx.require(&Count::File(file))? {
                        Ok(count) => total += count,
                        Err(e) => return Ok(Err(e)),
                    }
                }

                Ok(Ok(total))
            }
            Count::File(path) => {
                let file = ctx.require_resource(path, ResourceStamper::Hash)?;

                Ok(file
                    .read_to_string()
                    .with_context(|| format!("reading {path}"))
                    .map(|text| text.split_whitespace().count())
                    .map_err(TaskFailure::from))
            }
        }
    }
}

fn list_text_files(dir: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();

    for entry in dir.read_dir_utf8().with_context(|| format!("listing {dir}"))? {
        let path = entry?.into_path();
        if path.extension() == Some("txt") {
            files.push(path);
        }
    }

    Ok(files)
}

fn main() -> anyhow::Result<()> {
    tsumiki::init_logging()?;

    let mut args = std::env::args().skip(1);
    let dir = Utf8PathBuf::from(args.next().context("usage: word_count <dir> [--watch]")?);
    let watch = args.next().as_deref() == Some("--watch");

    let mut pie = Pie::<Count>::config()
        .store(".tsumiki")
        .progress(true)
        .finish()?;

    let root = Count::Directory(dir);

    if watch {
        pie.watch(std::slice::from_ref(&root), |outputs, report| {
            for output in outputs {
                match output {
                    Ok(Ok(total)) => println!("{total} words ({} tasks executed)", report.executed.len()),
                    Ok(Err(e)) => println!("failed: {e}"),
                    Err(e) => println!("engine error: {e}"),
                }
            }
            ControlFlow::Continue(())
        })?;

        return Ok(());
    }

    let (total, report) = pie.run_in_session(|session| session.require(&root))?;

    match total {
        Ok(total) => println!("{total} words"),
        Err(e) => println!("failed: {e}"),
    }

    for execution in &report.executed {
        println!("  executed {} ({})", execution.key, execution.reason);
    }
    println!("  reused {}", report.reused);

    Ok(())
}
