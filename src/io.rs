use std::fmt::Display;
use std::fs;
use std::io::Write;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;

const ANSI_BLUE: Style = Style::new().blue();

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Writes `data` to `path` through a sibling temporary file, so readers only
/// ever observe the old or the new content.
pub fn write_atomic(path: &Utf8Path, data: &[u8]) -> std::io::Result<()> {
    let temp = path.with_extension("tmp");

    {
        let mut file = fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    fs::rename(&temp, path)
}

/// Removes a file, treating a missing file as already removed.
pub fn remove_if_exists(path: &Utf8Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
