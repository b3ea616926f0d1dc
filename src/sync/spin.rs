/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Mutually exclusive access primitive based on a spinlock.
//!
//! A [`Spin`] protects its wrapped data from being accessed concurrently, avoiding data races.
//! The driver never owns the interrupt controller, so unlike the full kernel's variant this
//! spinlock does not mask interrupts: the host kernel is responsible for disabling them around
//! critical sections if that is required on its platform.

use core::{
	cell::UnsafeCell,
	fmt::{self, Formatter},
	hint,
	ops::{Deref, DerefMut},
	sync::atomic::{
		AtomicBool,
		Ordering::{Acquire, Release},
	},
};

#[inline(always)]
fn lock(lock: &AtomicBool) {
	while lock.swap(true, Acquire) {
		hint::spin_loop();
	}
}

/// Unlocks the associated [`Spin`] when dropped.
pub struct SpinGuard<'m, T: ?Sized> {
	spin: &'m Spin<T>,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		unsafe { &*self.spin.data.get() }
	}
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		unsafe { &mut *self.spin.data.get() }
	}
}

impl<T: ?Sized> !Send for SpinGuard<'_, T> {}

unsafe impl<T: ?Sized + Sync> Sync for SpinGuard<'_, T> {}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinGuard<'_, T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self.deref(), f)
	}
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
	fn drop(&mut self) {
		unsafe {
			self.spin.unlock();
		}
	}
}

/// Wraps a value which can be accessed by only one context at a time.
pub struct Spin<T: ?Sized> {
	spin: AtomicBool,
	data: UnsafeCell<T>,
}

impl<T> Spin<T> {
	/// Creates a new instance wrapping the given `data`.
	pub const fn new(data: T) -> Self {
		Self {
			spin: AtomicBool::new(false),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: Default> Default for Spin<T> {
	fn default() -> Self {
		Self::new(Default::default())
	}
}

impl<T: ?Sized> Spin<T> {
	/// Acquires the spinlock.
	///
	/// If the spinlock is already acquired, the thread loops until it becomes available.
	///
	/// The function returns a [`SpinGuard`] associated with `self`. When dropped, the spinlock
	/// is unlocked.
	pub fn lock(&self) -> SpinGuard<T> {
		lock(&self.spin);
		SpinGuard {
			spin: self,
		}
	}

	/// Releases the spinlock. This function should not be used directly since it is called when
	/// the guard is dropped.
	///
	/// # Safety
	///
	/// If the spinlock is not locked, the behaviour is undefined.
	///
	/// Releasing while the resource is being used may result in concurrent accesses.
	pub unsafe fn unlock(&self) {
		self.spin.store(false, Release);
	}
}

impl<T> Spin<T> {
	/// Acquires the spinlock, consumes it and returns the inner value.
	pub fn into_inner(self) -> T {
		lock(&self.spin);
		self.data.into_inner()
	}
}

unsafe impl<T> Sync for Spin<T> {}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Spin<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		let guard = self.lock();
		fmt::Debug::fmt(&*guard, f)
	}
}
