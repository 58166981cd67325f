//! Item-level contracts: readers, processors, writers and their classified errors.

use forgebatch_core::ExecutionContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification used by the fault-tolerance policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input data; retrying will not help.
    Validation,
    /// Temporary condition (lock timeout, dropped connection).
    Transient,
    /// Never skipped or retried.
    Fatal,
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ErrorKind::Validation => f.write_str("validation"),
            ErrorKind::Transient => f.write_str("transient"),
            ErrorKind::Fatal => f.write_str("fatal"),
        }
    }
}

/// Failure raised by a reader, processor or writer for one item or one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
    /// Position of the offending item inside the chunk handed to a writer, when known.
    pub item_index: Option<usize>,
}

impl ItemError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            item_index: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Point at the item inside a written chunk that caused the failure.
    pub fn at(mut self, item_index: usize) -> Self {
        self.item_index = Some(item_index);
        self
    }
}

/// Lazy, restartable source of input items.
pub trait ItemReader: Send {
    type Item;

    /// Restore the read position saved by a previous attempt.
    fn open(&mut self, _context: &ExecutionContext) -> Result<(), ItemError> {
        Ok(())
    }

    /// Next item, or `None` once the assigned domain is exhausted.
    fn read(&mut self) -> Result<Option<Self::Item>, ItemError>;

    /// Save the read position; called after every successful commit.
    fn update(&mut self, _context: &mut ExecutionContext) {}
}

/// Pure item transformation. `Ok(None)` filters the item out.
pub trait ItemProcessor<I, O>: Send + Sync {
    fn process(&self, item: &I) -> Result<Option<O>, ItemError>;
}

impl<I, O, F> ItemProcessor<I, O> for F
where
    F: Fn(&I) -> Result<Option<O>, ItemError> + Send + Sync,
{
    fn process(&self, item: &I) -> Result<Option<O>, ItemError> {
        self(item)
    }
}

/// Forwards every item unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl<T: Clone> ItemProcessor<T, T> for PassThrough {
    fn process(&self, item: &T) -> Result<Option<T>, ItemError> {
        Ok(Some(item.clone()))
    }
}

/// Commits one chunk all-or-nothing.
pub trait ItemWriter<O>: Send {
    fn write(&mut self, items: &[O]) -> Result<(), ItemError>;
}

impl<O, F> ItemWriter<O> for F
where
    F: FnMut(&[O]) -> Result<(), ItemError> + Send,
{
    fn write(&mut self, items: &[O]) -> Result<(), ItemError> {
        self(items)
    }
}

/// In-memory list reader that remembers how many items it handed out.
#[derive(Debug, Clone)]
pub struct VecReader<T> {
    name: String,
    items: Vec<T>,
    position: usize,
}

impl<T> VecReader<T> {
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            items,
            position: 0,
        }
    }

    fn position_key(&self) -> String {
        format!("{}.read.count", self.name)
    }
}

impl<T: Clone + Send> ItemReader for VecReader<T> {
    type Item = T;

    fn open(&mut self, context: &ExecutionContext) -> Result<(), ItemError> {
        self.position = context
            .get_u64(&self.position_key())
            .map(|p| p as usize)
            .unwrap_or(0)
            .min(self.items.len());
        Ok(())
    }

    fn read(&mut self) -> Result<Option<T>, ItemError> {
        let item = self.items.get(self.position).cloned();
        if item.is_some() {
            self.position += 1;
        }
        Ok(item)
    }

    fn update(&mut self, context: &mut ExecutionContext) {
        context.put_u64(self.position_key(), self.position as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_reader_resumes_from_saved_position() {
        let mut reader = VecReader::new("numbers", vec![1, 2, 3, 4]);
        reader.open(&ExecutionContext::new()).unwrap();
        assert_eq!(reader.read().unwrap(), Some(1));
        assert_eq!(reader.read().unwrap(), Some(2));

        let mut ctx = ExecutionContext::new();
        reader.update(&mut ctx);

        let mut resumed = VecReader::new("numbers", vec![1, 2, 3, 4]);
        resumed.open(&ctx).unwrap();
        assert_eq!(resumed.read().unwrap(), Some(3));
        assert_eq!(resumed.read().unwrap(), Some(4));
        assert_eq!(resumed.read().unwrap(), None);
    }

    #[test]
    fn closures_act_as_processors_and_writers() {
        let double = |x: &i32| -> Result<Option<i32>, ItemError> { Ok(Some(x * 2)) };
        assert_eq!(double.process(&4).unwrap(), Some(8));

        let mut seen = Vec::new();
        {
            let mut writer = |items: &[i32]| -> Result<(), ItemError> {
                seen.extend_from_slice(items);
                Ok(())
            };
            writer.write(&[1, 2]).unwrap();
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn item_error_display_includes_kind() {
        let err = ItemError::validation("negative amount").at(3);
        assert_eq!(err.to_string(), "validation error: negative amount");
        assert_eq!(err.item_index, Some(3));
    }
}
