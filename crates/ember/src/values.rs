/// Maximum number of values a task can report.
pub const VARS_PER_TASK: usize = 4;

/// The values reported by a task.
///
/// A task reports a small fixed set of numeric outputs, named by its plugin
/// through [`crate::plugin::Plugin::value_names`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskValues {
    values: [f32; VARS_PER_TASK],
    len: usize,
}

impl TaskValues {
    /// Creates [`TaskValues`] holding `len` zeroed values.
    ///
    /// `len` is clamped to [`VARS_PER_TASK`].
    #[must_use]
    pub const fn new(len: usize) -> Self {
        Self {
            values: [0.; VARS_PER_TASK],
            len: if len > VARS_PER_TASK { VARS_PER_TASK } else { len },
        }
    }

    /// Returns the number of values.
    #[must_use]
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Checks whether there are no values.
    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets a value.
    ///
    /// Returns `false` when `index` is out of range.
    pub fn set(&mut self, index: usize, value: f32) -> bool {
        if index >= self.len {
            return false;
        }
        self.values[index] = value;
        true
    }

    /// Returns a value.
    #[must_use]
    #[inline]
    pub fn get(&self, index: usize) -> Option<f32> {
        self.as_slice().get(index).copied()
    }

    /// Returns all values.
    #[must_use]
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.values[..self.len]
    }

    /// Iterates over all values.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        self.as_slice().iter().copied()
    }
}
