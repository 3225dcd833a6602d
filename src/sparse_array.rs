//! Sparse (timestep, state, ...) arrays with lazily materialized cells.
//!
//! A [`SparseTimestepStateArray`] presents a dense array of shape
//! `[horizon, num_states, d_0, d_1, ...]` but only stores the cells that were
//! written. A *cell* is the block of `d_0 * d_1 * ...` elements that shares
//! one `(timestep, state)` key; cells live in a [`ShardedMap`].
//!
//! - Reading an unwritten key returns the array's default cell.
//! - The first write to a key inserts a private copy of the default cell and
//!   then mutates it in place, all under the key's shard lock.
//!
//! Timesteps are `1..=horizon` and states `1..=num_states`; the trailing
//! dimensions are 0-based.
//!
//! Concurrent writes to *different* keys are safe. Concurrent writes to the
//! same element race on the last value; the sweeps never do that except for
//! idempotent boolean flags.

use std::fmt;

use crate::error::{ComputeError, Result};
use crate::sharded_map::ShardedMap;

/// (timestep, state) pair identifying one cell.
pub type CellKey = (u32, u32);

pub struct SparseTimestepStateArray<T> {
    shape: Vec<usize>,
    default_cell: Vec<T>,
    cells: ShardedMap<CellKey, Vec<T>>,
}

impl<T> fmt::Debug for SparseTimestepStateArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseTimestepStateArray")
            .field("shape", &self.shape)
            .field("materialized", &self.cells.len())
            .finish()
    }
}

impl<T: Copy> SparseTimestepStateArray<T> {
    /// Array of `shape` (at least `[horizon, num_states]`) where every element
    /// defaults to `default`.
    pub fn new(shape: &[usize], default: T, num_shards: usize) -> Result<Self> {
        if shape.len() < 2 {
            return Err(ComputeError::ShapeMismatch(format!(
                "sparse array needs at least (timestep, state) dimensions, got {shape:?}"
            )));
        }
        let cell_len = shape[2..].iter().product();
        Self::with_default_cell(shape, vec![default; cell_len], num_shards)
    }

    /// Array whose unmaterialized cells read as `default_cell`.
    ///
    /// `default_cell` must hold exactly as many elements as the trailing
    /// dimensions `shape[2..]` describe.
    pub fn with_default_cell(shape: &[usize], default_cell: Vec<T>, num_shards: usize) -> Result<Self> {
        if shape.len() < 2 {
            return Err(ComputeError::ShapeMismatch(format!(
                "sparse array needs at least (timestep, state) dimensions, got {shape:?}"
            )));
        }
        let cell_len: usize = shape[2..].iter().product();
        if default_cell.len() != cell_len {
            return Err(ComputeError::ShapeMismatch(format!(
                "default cell has {} elements, trailing dimensions {:?} need {}",
                default_cell.len(),
                &shape[2..],
                cell_len
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            default_cell,
            cells: ShardedMap::new(num_shards),
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn horizon(&self) -> usize {
        self.shape[0]
    }

    pub fn num_states(&self) -> usize {
        self.shape[1]
    }

    /// Number of elements per (timestep, state) cell.
    pub fn cell_len(&self) -> usize {
        self.default_cell.len()
    }

    /// Number of (timestep, state) keys that hold their own storage.
    pub fn materialized_len(&self) -> usize {
        self.cells.len()
    }

    fn key(&self, timestep: usize, state: usize) -> Result<CellKey> {
        let out_of_bounds = || ComputeError::OutOfBounds {
            index: vec![timestep, state],
            shape: self.shape.clone(),
        };
        if timestep == 0 || timestep > self.shape[0] || state == 0 || state > self.shape[1] {
            return Err(out_of_bounds());
        }
        // Keys are packed as u32 pairs; larger indices cannot be stored.
        let t = u32::try_from(timestep).map_err(|_| out_of_bounds())?;
        let s = u32::try_from(state).map_err(|_| out_of_bounds())?;
        Ok((t, s))
    }

    /// Split a full index into its cell key and the row-major offset inside the cell.
    fn locate(&self, index: &[usize]) -> Result<(CellKey, usize)> {
        if index.len() != self.shape.len() {
            return Err(ComputeError::ShapeMismatch(format!(
                "index {index:?} has {} dimensions, array has {}",
                index.len(),
                self.shape.len()
            )));
        }
        let key = self.key(index[0], index[1])?;
        let mut offset = 0;
        for (&i, &dim) in index[2..].iter().zip(&self.shape[2..]) {
            if i >= dim {
                return Err(ComputeError::OutOfBounds {
                    index: index.to_vec(),
                    shape: self.shape.clone(),
                });
            }
            offset = offset * dim + i;
        }
        Ok((key, offset))
    }

    /// Element at `index` (`[timestep, state, ...]`), or the default if the cell
    /// was never written.
    pub fn read(&self, index: &[usize]) -> Result<T> {
        let (key, offset) = self.locate(index)?;
        Ok(self
            .cells
            .inspect(&key, |cell| cell.map_or(self.default_cell[offset], |c| c[offset])))
    }

    /// Write one element, materializing the cell from the default first.
    pub fn write(&self, index: &[usize], value: T) -> Result<()> {
        let (key, offset) = self.locate(index)?;
        self.cells
            .with_mut_or_insert(key, || self.default_cell.clone(), |cell| cell[offset] = value);
        Ok(())
    }

    /// Scalar read for arrays without trailing dimensions.
    pub fn get(&self, timestep: usize, state: usize) -> Result<T> {
        self.read(&[timestep, state])
    }

    pub fn set(&self, timestep: usize, state: usize, value: T) -> Result<()> {
        self.write(&[timestep, state], value)
    }

    /// Read from an array shaped `[horizon, num_states, num_actions]`.
    pub fn get_action(&self, timestep: usize, state: usize, action: usize) -> Result<T> {
        self.read(&[timestep, state, action])
    }

    pub fn set_action(&self, timestep: usize, state: usize, action: usize, value: T) -> Result<()> {
        self.write(&[timestep, state, action], value)
    }

    pub fn is_materialized(&self, timestep: usize, state: usize) -> Result<bool> {
        let key = self.key(timestep, state)?;
        Ok(self.cells.contains(&key))
    }

    /// Run `f` on the whole cell at (timestep, state) under its shard lock.
    pub fn with_cell<R>(&self, timestep: usize, state: usize, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        let key = self.key(timestep, state)?;
        Ok(self
            .cells
            .inspect(&key, |cell| f(cell.map_or(&self.default_cell[..], |c| &c[..]))))
    }

    /// Copy of the whole cell at (timestep, state).
    pub fn cell(&self, timestep: usize, state: usize) -> Result<Vec<T>> {
        self.with_cell(timestep, state, |c| c.to_vec())
    }

    /// Replace the whole cell at (timestep, state).
    pub fn write_cell(&self, timestep: usize, state: usize, values: &[T]) -> Result<()> {
        let key = self.key(timestep, state)?;
        if values.len() != self.default_cell.len() {
            return Err(ComputeError::ShapeMismatch(format!(
                "cell write of {} elements, cells hold {}",
                values.len(),
                self.default_cell.len()
            )));
        }
        self.cells.set(key, values.to_vec());
        Ok(())
    }

    /// Visit every materialized cell as `(timestep, state, cell)`.
    ///
    /// Single-threaded use only: see [`ShardedMap::for_each`].
    pub fn for_each_materialized(&self, mut f: impl FnMut(usize, usize, &[T])) {
        self.cells
            .for_each(|&(t, s), cell| f(t as usize, s as usize, cell));
    }

    /// Independent copy: same shape and default, every materialized cell duplicated.
    pub fn deep_clone(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            default_cell: self.default_cell.clone(),
            cells: self.cells.deep_clone(),
        }
    }
}

impl<T: Copy + PartialOrd> SparseTimestepStateArray<T> {
    fn reduce(&self, keep_new: impl Fn(T, T) -> bool) -> Result<T> {
        let mut best: Option<T> = None;
        self.for_each_materialized(|_, _, cell| {
            for &v in cell {
                best = match best {
                    Some(b) if !keep_new(v, b) => Some(b),
                    _ => Some(v),
                };
            }
        });
        best.ok_or(ComputeError::EmptyReduction)
    }

    /// Largest element over all materialized cells. Unwritten cells are ignored.
    pub fn maximum(&self) -> Result<T> {
        self.reduce(|new, best| new > best)
    }

    /// Smallest element over all materialized cells.
    pub fn minimum(&self) -> Result<T> {
        self.reduce(|new, best| new < best)
    }
}
