//! Human-readable mode summary
//!
//! Renders one line per mode field with the selected option marked in
//! brackets. Fields that are unset are left out entirely.

use std::io::{self, Write};

use super::mode::{Density, FormatVariant, ModeWord, VideoStandard};

fn option_row<T: Copy + PartialEq>(
    out: &mut impl Write,
    title: &str,
    options: &[T],
    selected: T,
    label: impl Fn(T) -> &'static str,
) -> io::Result<()> {
    write!(out, "{:<15}", title)?;
    for &option in options {
        if option == selected {
            write!(out, " [{}]", label(option))?;
        } else {
            write!(out, "  {} ", label(option))?;
        }
    }
    writeln!(out)
}

/// Write the summary for `mode` to `out`.
pub fn write_summary(mode: ModeWord, out: &mut impl Write) -> io::Result<()> {
    if let Some(standard) = mode.standard() {
        option_row(out, "Video standard:", &VideoStandard::ALL, standard, VideoStandard::label)?;
    }
    if let Some(density) = mode.density() {
        option_row(out, "Bit density:", &Density::ALL, density, Density::label)?;
    }
    if let Some(format) = mode.format() {
        option_row(out, "Sector format:", &FormatVariant::ALL, format, FormatVariant::label)?;
    }
    if let Some(secs) = mode.timeout_secs() {
        writeln!(out, "{:<15} {} s", "Timeout:", secs)?;
    }
    Ok(())
}

/// Render the summary into a `String`.
pub fn summary(mode: ModeWord) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail
    let _ = write_summary(mode, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_summary() {
        let mode = ModeWord::pack(
            Some(VideoStandard::Pal),
            Some(Density::Low),
            Some(FormatVariant::Ep),
            Some(7),
        );
        let text = summary(mode);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("[PAL]"));
        assert!(lines[0].contains(" NTSC "));
        assert!(lines[1].contains("[LOW]"));
        assert!(lines[2].contains("[EP]"));
        assert!(lines[3].ends_with("7 s"));
    }

    #[test]
    fn test_unset_fields_are_omitted() {
        let text = summary(ModeWord::pack(None, None, Some(FormatVariant::Sp), None));
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("Sector format:"));

        assert!(summary(ModeWord::UNSET).is_empty());
    }
}
