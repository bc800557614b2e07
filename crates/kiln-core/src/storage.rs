//! Reference-counted f32 buffers.

use std::sync::Arc;

use crate::device::Device;

/// Shared, copy-on-write element buffer.
///
/// Cloning a `Storage` is an `Arc` bump. Mutable access goes through
/// `Arc::make_mut`, so a buffer still referenced by a saved autograd
/// context is copied rather than modified underneath it.
#[derive(Clone, Debug)]
pub struct Storage {
    data: Arc<Vec<f32>>,
    device: Device,
}

impl Storage {
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self { data: Arc::new(data), device: Device::Cpu }
    }

    pub fn zeros(len: usize) -> Self {
        Self::from_vec(vec![0.0; len])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Whether two storages point at the same buffer.
    pub fn shares_buffer(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_buffer() {
        let a = Storage::from_vec(vec![1.0, 2.0]);
        let b = a.clone();
        assert!(a.shares_buffer(&b));
    }

    #[test]
    fn test_write_after_clone_copies() {
        let a = Storage::from_vec(vec![1.0, 2.0]);
        let mut b = a.clone();
        b.as_mut_slice()[0] = 9.0;
        assert_eq!(a.as_slice(), &[1.0, 2.0]);
        assert_eq!(b.as_slice(), &[9.0, 2.0]);
        assert!(!a.shares_buffer(&b));
    }
}
