use std::fmt::Write as _;

/// Target placeholder style for rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// PostgreSQL-style placeholders like `$1`.
    #[default]
    Postgres,
    /// SQLite-style numbered placeholders like `?1`.
    Sqlite,
    /// Unnumbered `?`; bind order alone decides which value goes where.
    Positional,
}

impl PlaceholderStyle {
    /// Append the placeholder for the 1-based parameter `index`.
    pub(crate) fn write(self, out: &mut String, index: usize) {
        // Writing to a String cannot fail.
        let _ = match self {
            PlaceholderStyle::Postgres => write!(out, "${index}"),
            PlaceholderStyle::Sqlite => write!(out, "?{index}"),
            PlaceholderStyle::Positional => {
                out.push('?');
                Ok(())
            }
        };
    }
}
