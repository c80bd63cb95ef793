use alloc::vec::Vec;

use core::str::FromStr;

/// An out-of-band command for a plugin.
///
/// A command is a comma-separated line, such as `neopixel,1,255,0,0`.
/// The first field is the command name, the remaining ones are its
/// arguments. Surrounding whitespace of every field is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    name: &'a str,
    args: Vec<&'a str>,
}

impl<'a> Command<'a> {
    /// Parses a [`Command`] from a line.
    ///
    /// Returns `None` for a line without a command name.
    #[must_use]
    pub fn parse(line: &'a str) -> Option<Self> {
        let mut fields = line.split(',').map(str::trim);
        let name = fields.next().filter(|name| !name.is_empty())?;

        Some(Self {
            name,
            args: fields.collect(),
        })
    }

    /// Returns the command name as written.
    #[must_use]
    #[inline]
    pub const fn name(&self) -> &'a str {
        self.name
    }

    /// Checks the command name, ignoring ASCII case.
    #[must_use]
    #[inline]
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Returns the number of arguments.
    #[must_use]
    #[inline]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Returns an argument as written.
    #[must_use]
    #[inline]
    pub fn raw_arg(&self, index: usize) -> Option<&'a str> {
        self.args.get(index).copied()
    }

    /// Parses an argument.
    ///
    /// Returns `None` when the argument is missing or malformed.
    #[must_use]
    pub fn arg<T: FromStr>(&self, index: usize) -> Option<T> {
        self.raw_arg(index)?.parse().ok()
    }

    /// Parses an optional argument.
    ///
    /// Returns `Some(None)` when the argument is missing and `None` when it
    /// is malformed.
    #[must_use]
    pub fn optional_arg<T: FromStr>(&self, index: usize) -> Option<Option<T>> {
        match self.raw_arg(index) {
            None | Some("") => Some(None),
            Some(raw) => raw.parse().ok().map(Some),
        }
    }
}
