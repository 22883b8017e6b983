// Copyright 2025 The forkgraph authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Type-erased function values, storing small closures inline.

use crate::macros::log_error;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of, MaybeUninit};
use std::ptr::NonNull;

/// Maximal size (in bytes) of a closure that a [`Callable`] stores inline,
/// without a heap allocation.
pub const SMALL_CALLABLE_SIZE: usize = 64;

/// Inline storage for small closures.
#[repr(C, align(16))]
struct InlineBuffer(MaybeUninit<[u8; SMALL_CALLABLE_SIZE]>);

impl InlineBuffer {
    fn uninit() -> Self {
        Self(MaybeUninit::uninit())
    }

    /// Whether a value of type `F` fits in this buffer, both in size and
    /// alignment.
    const fn fits<F>() -> bool {
        size_of::<F>() <= SMALL_CALLABLE_SIZE && align_of::<F>() <= align_of::<InlineBuffer>()
    }

    fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr().cast()
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr().cast()
    }
}

/// A function that can be invoked with a tuple of arguments.
///
/// This is implemented for every [`Fn`] closure taking up to 4 arguments, with
/// `Args` the tuple of argument types (`()` for a closure taking no
/// argument).
pub trait Invoke<Args, R> {
    /// Calls this function with the given arguments.
    fn invoke(&self, args: Args) -> R;
}

macro_rules! invoke_tuple {
    ( $($arg:ident $i:tt),* ) => {
        impl<F, R, $($arg),*> Invoke<($($arg,)*), R> for F
        where
            F: Fn($($arg),*) -> R,
        {
            #[allow(unused_variables, clippy::unused_unit)]
            fn invoke(&self, args: ($($arg,)*)) -> R {
                (self)($(args.$i),*)
            }
        }
    };
}

invoke_tuple!();
invoke_tuple!(A 0);
invoke_tuple!(A 0, B 1);
invoke_tuple!(A 0, B 1, C 2);
invoke_tuple!(A 0, B 1, C 2, D 3);

/// Erased operations on the concrete closure type, resolved when the
/// [`Callable`] is created.
struct VTable<'a, Args, R> {
    call: unsafe fn(*const u8, Args) -> R,
    clone: unsafe fn(*const u8) -> Callable<'a, Args, R>,
    drop: unsafe fn(*mut u8),
    /// The erased closure may borrow data for `'a`.
    _marker: PhantomData<&'a ()>,
}

impl<Args, R> Clone for VTable<'_, Args, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Args, R> Copy for VTable<'_, Args, R> {}

impl<'a, Args, R> VTable<'a, Args, R> {
    fn of<F>(inline: bool) -> Self
    where
        F: Invoke<Args, R> + Clone + Send + Sync + 'a,
    {
        Self {
            call: call_erased::<F, Args, R>,
            clone: clone_erased::<F, Args, R>,
            drop: if inline {
                drop_inline::<F>
            } else {
                drop_heap::<F>
            },
            _marker: PhantomData,
        }
    }
}

/// # Safety
///
/// `ptr` must point to a valid `F`.
unsafe fn call_erased<F: Invoke<Args, R>, Args, R>(ptr: *const u8, args: Args) -> R {
    // SAFETY: The caller guarantees that `ptr` points to a valid `F`.
    let f = unsafe { &*ptr.cast::<F>() };
    f.invoke(args)
}

/// # Safety
///
/// `ptr` must point to a valid `F`.
unsafe fn clone_erased<'a, F, Args, R>(ptr: *const u8) -> Callable<'a, Args, R>
where
    F: Invoke<Args, R> + Clone + Send + Sync + 'a,
{
    // SAFETY: The caller guarantees that `ptr` points to a valid `F`.
    let f = unsafe { &*ptr.cast::<F>() };
    Callable::new(f.clone())
}

/// # Safety
///
/// `ptr` must point to a valid `F` stored in an [`InlineBuffer`], which isn't
/// used anymore after this call.
unsafe fn drop_inline<F>(ptr: *mut u8) {
    // SAFETY: The caller guarantees that `ptr` points to a valid `F` that is
    // never accessed again.
    unsafe { std::ptr::drop_in_place(ptr.cast::<F>()) }
}

/// # Safety
///
/// `ptr` must have been obtained from a `Box<F>`, and isn't used anymore after
/// this call.
unsafe fn drop_heap<F>(ptr: *mut u8) {
    // SAFETY: The caller guarantees that `ptr` comes from a `Box<F>` that is
    // never accessed again.
    drop(unsafe { Box::from_raw(ptr.cast::<F>()) })
}

enum Repr<'a, Args, R> {
    Empty,
    Inline {
        buffer: InlineBuffer,
        vtable: VTable<'a, Args, R>,
    },
    Heap {
        ptr: NonNull<u8>,
        vtable: VTable<'a, Args, R>,
    },
}

/// A clonable, type-erased function value taking `Args` (a tuple of
/// arguments) and returning `R`.
///
/// Closures of at most [`SMALL_CALLABLE_SIZE`] bytes are stored inline,
/// larger ones in a single heap allocation. Cloning a [`Callable`] clones the
/// underlying closure, so that two callables never share state other than
/// what the closure itself shares (e.g. captured references).
///
/// ```
/// # use forkgraph::Callable;
/// let offset = 10;
/// let add: Callable<(i32, i32), i32> = Callable::new(move |a: i32, b: i32| a + b + offset);
/// let copy = add.clone();
/// drop(add);
/// assert_eq!(copy.call((1, 2)), 13);
/// ```
pub struct Callable<'a, Args, R = ()> {
    repr: Repr<'a, Args, R>,
}

// SAFETY: A non-empty `Callable` can only be created by `Callable::new()`,
// which requires the closure to be `Send`. The erased operations only ever
// move, clone, call or drop that closure.
unsafe impl<Args, R> Send for Callable<'_, Args, R> {}
// SAFETY: `Callable::new()` requires the closure to be `Sync`, and the only
// operations available through a shared reference are `call()` and
// `clone()`, which take the closure by shared reference.
unsafe impl<Args, R> Sync for Callable<'_, Args, R> {}

impl<'a, Args, R> Callable<'a, Args, R> {
    /// Wraps the given closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Invoke<Args, R> + Clone + Send + Sync + 'a,
    {
        let repr = if InlineBuffer::fits::<F>() {
            let mut buffer = InlineBuffer::uninit();
            // SAFETY: The buffer is large enough and sufficiently aligned for an `F`, as
            // checked by `fits()`.
            unsafe { buffer.as_mut_ptr().cast::<F>().write(f) };
            Repr::Inline {
                buffer,
                vtable: VTable::of::<F>(true),
            }
        } else {
            Repr::Heap {
                ptr: NonNull::from(Box::leak(Box::new(f))).cast(),
                vtable: VTable::of::<F>(false),
            }
        };
        Self { repr }
    }

    /// Creates an empty callable, which must not be called.
    pub fn empty() -> Self {
        Self { repr: Repr::Empty }
    }

    /// Replaces the wrapped function by the given closure, dropping the
    /// previous one.
    pub fn set<F>(&mut self, f: F)
    where
        F: Invoke<Args, R> + Clone + Send + Sync + 'a,
    {
        *self = Self::new(f);
    }

    /// Calls the wrapped function.
    ///
    /// # Panics
    ///
    /// Panics if this callable is empty.
    pub fn call(&self, args: Args) -> R {
        match &self.repr {
            Repr::Empty => {
                log_error!("Called an empty Callable");
                panic!("called an empty Callable")
            }
            // SAFETY: The buffer contains a valid closure, of the type that this vtable was
            // created for.
            Repr::Inline { buffer, vtable } => unsafe { (vtable.call)(buffer.as_ptr(), args) },
            // SAFETY: The pointer comes from a live `Box` of the closure type that this
            // vtable was created for.
            Repr::Heap { ptr, vtable } => unsafe { (vtable.call)(ptr.as_ptr(), args) },
        }
    }

    /// Returns true if this callable wraps a function.
    pub fn is_some(&self) -> bool {
        !self.is_empty()
    }

    /// Returns true if this callable doesn't wrap any function.
    pub fn is_empty(&self) -> bool {
        matches!(self.repr, Repr::Empty)
    }

    /// Returns true if the wrapped function is stored inline.
    pub fn is_inline(&self) -> bool {
        matches!(self.repr, Repr::Inline { .. })
    }
}

impl<Args, R> Clone for Callable<'_, Args, R> {
    fn clone(&self) -> Self {
        match &self.repr {
            Repr::Empty => Self::empty(),
            // SAFETY: The buffer contains a valid closure, of the type that this vtable was
            // created for.
            Repr::Inline { buffer, vtable } => unsafe { (vtable.clone)(buffer.as_ptr()) },
            // SAFETY: The pointer comes from a live `Box` of the closure type that this
            // vtable was created for.
            Repr::Heap { ptr, vtable } => unsafe { (vtable.clone)(ptr.as_ptr()) },
        }
    }
}

impl<Args, R> Drop for Callable<'_, Args, R> {
    fn drop(&mut self) {
        match &mut self.repr {
            Repr::Empty => (),
            // SAFETY: The buffer contains a valid closure of the type that this vtable was
            // created for, and is never accessed again.
            Repr::Inline { buffer, vtable } => unsafe { (vtable.drop)(buffer.as_mut_ptr()) },
            // SAFETY: The pointer was obtained from a `Box` of the closure type that this
            // vtable was created for, and is never accessed again.
            Repr::Heap { ptr, vtable } => unsafe { (vtable.drop)(ptr.as_ptr()) },
        }
    }
}

impl<Args, R> Default for Callable<'_, Args, R> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<Args, R> fmt::Debug for Callable<'_, Args, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = match self.repr {
            Repr::Empty => "empty",
            Repr::Inline { .. } => "inline",
            Repr::Heap { .. } => "heap",
        };
        f.debug_struct("Callable")
            .field("storage", &storage)
            .finish()
    }
}
