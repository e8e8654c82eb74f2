//! # Argument Builder
//!
//! Builds the argument list of one call: register-class scalars plus buffers
//! copied onto the callee's stack frame.
//!
//! A [`CallArgs`] is owned by the caller and independent of any process. Each
//! dispatch takes an [`ArgsImage`] snapshot, so the same builder can be
//! cleared and refilled as soon as `call_async` returns.
//!
//! ## Register encoding
//!
//! Every slot becomes one 64-bit word:
//! - `i32` is sign-extended, `u32` zero-extended.
//! - `f32` occupies the upper 32 bits, the lower half is zero.
//! - `f64` is passed as its raw bits.
//!
//! A stack slot becomes a pointer to its copy; the worker patches it once the
//! stack frame address is known.

/// Upper bound on the combined size of stack arguments for one call.
///
/// The worker's initial stack is 64 MiB; one MiB is left for the callee.
pub const STACK_ARGS_LIMIT: usize = 63 * 1024 * 1024;

/// Highest argument count accepted by the builder.
pub const MAX_ARGS: usize = 256;

const STACK_ALIGN: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The argument index is beyond [`MAX_ARGS`].
    IndexOutOfRange { index: usize },
    /// Only copy-in stack arguments are supported.
    UnsupportedIntent(Intent),
    /// Stack arguments would not fit the worker's initial stack.
    StackTooLarge { size: usize, limit: usize },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IndexOutOfRange { index } => write!(f, "argument #{} exceeds the limit of {}", index, MAX_ARGS),
            Self::UnsupportedIntent(intent) => write!(f, "unsupported stack argument intent: {:?}", intent),
            Self::StackTooLarge { size, limit } => write!(f, "stack arguments take {} bytes, limit is {}", size, limit),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Direction of the copy for a stack-passed buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Intent {
    /// Copied to the device before the call.
    In,
    /// Copied back to the host after the call.
    Out,
    InOut,
}

/// A register-class argument value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Scalar {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Scalar {
    /// Register word for this value.
    pub fn to_word(self) -> u64 {
        match self {
            Self::I32(v) => v as i64 as u64,
            Self::U32(v) => v as u64,
            Self::I64(v) => v as u64,
            Self::U64(v) => v,
            Self::F32(v) => (v.to_bits() as u64) << 32,
            Self::F64(v) => v.to_bits(),
        }
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self { Self::I32(v) }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self { Self::U32(v) }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self { Self::I64(v) }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self { Self::U64(v) }
}

impl From<f32> for Scalar {
    fn from(v: f32) -> Self { Self::F32(v) }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self { Self::F64(v) }
}

#[derive(Clone, Debug, PartialEq)]
enum Slot {
    /// Gap left by setting a higher index first. Passed as zero.
    Unset,
    Scalar(Scalar),
    Stack { bytes: Vec<u8> },
}

/// A reusable, growable argument list.
#[derive(Clone, Debug, Default)]
pub struct CallArgs {
    slots: Vec<Slot>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a scalar at `index`, growing the list with zero slots if needed.
    pub fn set(&mut self, index: usize, value: impl Into<Scalar>) -> Result<()> {
        *self.slot_mut(index)? = Slot::Scalar(value.into());
        Ok(())
    }

    /// Copies `bytes` for the callee's stack and passes a pointer to the copy at `index`.
    pub fn set_on_stack(&mut self, intent: Intent, index: usize, bytes: &[u8]) -> Result<()> {
        if intent != Intent::In {
            return Err(Error::UnsupportedIntent(intent));
        }
        *self.slot_mut(index)? = Slot::Stack { bytes: bytes.to_vec() };
        Ok(())
    }

    /// Drops every argument. The backing storage is kept for reuse.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes the stack arguments will occupy, alignment padding included.
    pub fn stack_len(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Stack { bytes } => align_up(bytes.len()),
                _ => 0,
            })
            .sum()
    }

    /// Freezes the list into the image sent along with a call.
    pub fn snapshot(&self) -> Result<ArgsImage> {
        let size = self.stack_len();
        if size > STACK_ARGS_LIMIT {
            return Err(Error::StackTooLarge { size, limit: STACK_ARGS_LIMIT });
        }

        let mut stack = Vec::with_capacity(size);
        let mut words = Vec::with_capacity(self.slots.len());

        for slot in &self.slots {
            let word = match slot {
                Slot::Unset => ArgWord::Value(0),
                Slot::Scalar(s) => ArgWord::Value(s.to_word()),
                Slot::Stack { bytes } => {
                    let offset = stack.len();
                    stack.extend_from_slice(bytes);
                    stack.resize(offset + align_up(bytes.len()), 0);
                    ArgWord::Stack { offset, len: bytes.len() }
                }
            };
            words.push(word);
        }

        Ok(ArgsImage { words, stack })
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot> {
        if index >= MAX_ARGS {
            return Err(Error::IndexOutOfRange { index });
        }
        if index >= self.slots.len() {
            self.slots.resize(index + 1, Slot::Unset);
        }
        Ok(&mut self.slots[index])
    }
}

fn align_up(n: usize) -> usize {
    (n + STACK_ALIGN - 1) & !(STACK_ALIGN - 1)
}

/// One argument as it crosses to the worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgWord {
    Value(u64),
    /// Pointer to `stack[offset..offset + len]` once placed on the callee's stack.
    Stack { offset: usize, len: usize },
}

/// Immutable snapshot of a [`CallArgs`] taken at dispatch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArgsImage {
    pub words: Vec<ArgWord>,
    /// Concatenated stack buffers, each padded to 8 bytes.
    pub stack: Vec<u8>,
}

impl ArgsImage {
    /// Resolves every word against the address the stack blob was copied to.
    pub fn resolve(&self, stack_base: u64) -> Vec<u64> {
        self.words
            .iter()
            .map(|w| match *w {
                ArgWord::Value(v) => v,
                ArgWord::Stack { offset, .. } => stack_base + offset as u64,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_register_encoding() {
        assert_eq!(Scalar::from(-1i32).to_word(), u64::MAX);
        assert_eq!(Scalar::from(u32::MAX).to_word(), 0xffff_ffff);
        assert_eq!(Scalar::from(-2i64).to_word(), (-2i64) as u64);
        assert_eq!(Scalar::from(7u64).to_word(), 7);
        assert_eq!(Scalar::from(1.5f32).to_word(), (1.5f32.to_bits() as u64) << 32);
        assert_eq!(Scalar::from(2.25f64).to_word(), 2.25f64.to_bits());
    }

    #[test]
    fn test_gaps_are_zero_filled() {
        let mut args = CallArgs::new();
        args.set(3, 9u64).unwrap();
        assert_eq!(args.len(), 4);

        let image = args.snapshot().unwrap();
        assert_eq!(image.words, vec![
            ArgWord::Value(0),
            ArgWord::Value(0),
            ArgWord::Value(0),
            ArgWord::Value(9),
        ]);
    }

    #[test]
    fn test_overwrite_keeps_length() {
        let mut args = CallArgs::new();
        args.set(0, 1i32).unwrap();
        args.set(1, 2i32).unwrap();
        args.set(0, 3i32).unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args.snapshot().unwrap().words[0], ArgWord::Value(3));
    }

    #[test]
    fn test_index_limit() {
        let mut args = CallArgs::new();
        assert_eq!(args.set(MAX_ARGS, 1u32), Err(Error::IndexOutOfRange { index: MAX_ARGS }));
        assert!(args.is_empty());
    }

    #[test]
    fn test_stack_layout_is_aligned() {
        let mut args = CallArgs::new();
        args.set_on_stack(Intent::In, 0, b"abc").unwrap();
        args.set(1, 5u64).unwrap();
        args.set_on_stack(Intent::In, 2, &[1u8; 9]).unwrap();

        let image = args.snapshot().unwrap();
        assert_eq!(image.words[0], ArgWord::Stack { offset: 0, len: 3 });
        assert_eq!(image.words[1], ArgWord::Value(5));
        assert_eq!(image.words[2], ArgWord::Stack { offset: 8, len: 9 });
        assert_eq!(image.stack.len(), 24);
        assert_eq!(&image.stack[..3], b"abc");

        let resolved = image.resolve(0x1000);
        assert_eq!(resolved, vec![0x1000, 5, 0x1008]);
    }

    #[test]
    fn test_only_copy_in_is_supported() {
        let mut args = CallArgs::new();
        assert_eq!(
            args.set_on_stack(Intent::Out, 0, b"x"),
            Err(Error::UnsupportedIntent(Intent::Out))
        );
        assert_eq!(
            args.set_on_stack(Intent::InOut, 0, b"x"),
            Err(Error::UnsupportedIntent(Intent::InOut))
        );
    }

    #[test]
    fn test_snapshot_is_independent_of_builder() {
        let mut args = CallArgs::new();
        let mut buf = vec![1u8, 2, 3, 4];
        args.set_on_stack(Intent::In, 0, &buf).unwrap();
        buf.fill(0);

        let image = args.snapshot().unwrap();
        args.clear();
        args.set(0, 42u64).unwrap();

        assert_eq!(&image.stack[..4], &[1, 2, 3, 4]);
        assert_eq!(image.words.len(), 1);
    }

    #[test]
    fn test_stack_ceiling() {
        let mut args = CallArgs::new();
        let big = vec![0u8; STACK_ARGS_LIMIT / 2 + 8];
        args.set_on_stack(Intent::In, 0, &big).unwrap();
        args.set_on_stack(Intent::In, 1, &big).unwrap();

        match args.snapshot() {
            Err(Error::StackTooLarge { limit, .. }) => assert_eq!(limit, STACK_ARGS_LIMIT),
            other => panic!("expected StackTooLarge, got {:?}", other.map(|_| ())),
        }
    }
}
