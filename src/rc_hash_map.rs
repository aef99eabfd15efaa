//! A reference-counted map: Values stay until their key was released as often as it was retained.
//!
//! The updater uses this to register one DOM listener per event type, however often that type is listed.

use core::{
	borrow::Borrow,
	hash::{BuildHasher, Hash},
};
use hashbrown::{
	hash_map::{DefaultHashBuilder, Entry},
	HashMap,
};
use num_traits::{CheckedAdd, CheckedSub, One, Zero};
use thiserror::Error;

pub struct RcHashMap<K, C, V, S = DefaultHashBuilder>(HashMap<K, (C, V), S>)
where
	K: Hash + Eq,
	C: CheckedAdd + CheckedSub + One + Zero,
	S: BuildHasher;
impl<K, C, V, S> Default for RcHashMap<K, C, V, S>
where
	K: Hash + Eq,
	C: CheckedAdd + CheckedSub + One + Zero,
	S: Default + BuildHasher,
{
	fn default() -> Self {
		Self::new()
	}
}
impl<K, C, V, S> RcHashMap<K, C, V, S>
where
	K: Hash + Eq,
	C: CheckedAdd + CheckedSub + One + Zero,
	S: BuildHasher,
{
	#[must_use]
	pub fn new() -> Self
	where
		S: Default,
	{
		Self(HashMap::with_hasher(S::default()))
	}

	/// Retains `k`, inserting the value returned by `v` if it isn't present yet.
	///
	/// `v` is only called for new keys. The returned [`bool`] is `true` iff it was.
	///
	/// # Errors
	///
	/// Iff the count of `k` would overflow `C`.
	pub fn increment_or_insert_with<F: FnOnce() -> V>(&mut self, k: K, v: F) -> Result<(&mut V, bool), CountSaturatedError> {
		match self.0.entry(k) {
			Entry::Occupied(occupied) => {
				let (c, v) = occupied.into_mut();
				*c = c.checked_add(&C::one()).ok_or(CountSaturatedError)?;
				Ok((v, false))
			}
			Entry::Vacant(vacant) => {
				let (_, v) = vacant.insert((C::one(), v()));
				Ok((v, true))
			}
		}
	}

	/// Releases `k` once without removing it, even if its count reaches zero.
	///
	/// Use [`drain_weak`](`RcHashMap::drain_weak`) to take out unretained entries.
	///
	/// # Errors
	///
	/// Iff the count of `k` is already zero.
	pub fn weak_decrement<Q: ?Sized>(&mut self, k: &Q) -> Result<Option<&mut V>, CountSaturatedError>
	where
		K: Borrow<Q>,
		Q: Eq + Hash,
	{
		match self.0.get_mut(k) {
			Some((c, v)) => {
				*c = c.checked_sub(&C::one()).ok_or(CountSaturatedError)?;
				Ok(Some(v))
			}
			None => Ok(None),
		}
	}

	pub fn get<Q: ?Sized>(&self, k: &Q) -> Option<&V>
	where
		K: Borrow<Q>,
		Q: Eq + Hash,
	{
		self.0.get(k).map(|(_, v)| v)
	}

	/// The current retain count of `k`, or [`None`] if it isn't present.
	pub fn count<Q: ?Sized>(&self, k: &Q) -> Option<&C>
	where
		K: Borrow<Q>,
		Q: Eq + Hash,
	{
		self.0.get(k).map(|(c, _)| c)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	#[must_use]
	pub fn capacity(&self) -> usize {
		self.0.capacity()
	}

	/// Removes and yields all entries whose count is zero.
	pub fn drain_weak(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
		self.0.extract_if(|_, (c, _)| c.is_zero()).map(|(k, (_, v))| (k, v))
	}

	/// Removes and yields all entries regardless of their count.
	pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
		self.0.drain().map(|(k, (_, v))| (k, v))
	}
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Reference count saturated")]
pub struct CountSaturatedError;
