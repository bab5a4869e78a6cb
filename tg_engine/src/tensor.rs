//! The user-facing tensor handle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tg_tensor::{layout, Backend, Result, Shape, TensorData, TensorError};

use crate::autograd::AutogradState;
use crate::context::ComputeContext;
use crate::device::Device;
use crate::storage::{dispatch_unary, Storage};

static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity of a tensor in the autograd graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        NodeId(NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct TensorState {
    pub(crate) storage: Storage,
    pub(crate) autograd: Option<AutogradState>,
}

pub(crate) struct TensorNode {
    id: NodeId,
    ctx: ComputeContext,
    state: RwLock<TensorState>,
}

/// A dense `f32` tensor on the CPU or the GPU.
///
/// `Clone` shares the handle: both clones see the same storage and the same
/// gradient. Use [`Tensor::deep_clone`] for an independent copy.
#[derive(Clone)]
pub struct Tensor(Arc<TensorNode>);

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Tensor")
            .field("id", &self.0.id)
            .field("shape", state.storage.shape())
            .field("device", &state.storage.device())
            .field("tracked", &state.autograd.is_some())
            .finish()
    }
}

impl Tensor {
    pub(crate) fn from_storage(ctx: &ComputeContext, storage: Storage) -> Self {
        Self::with_state(ctx, storage, None)
    }

    pub(crate) fn with_state(
        ctx: &ComputeContext,
        storage: Storage,
        autograd: Option<AutogradState>,
    ) -> Self {
        Tensor(Arc::new(TensorNode {
            id: NodeId::next(),
            ctx: ctx.clone(),
            state: RwLock::new(TensorState { storage, autograd }),
        }))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, TensorState> {
        self.0.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, TensorState> {
        self.0.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on both storages, locking once when `self` and `other` are the same tensor.
    pub(crate) fn with_storages<R>(
        &self,
        other: &Tensor,
        f: impl FnOnce(&Storage, &Storage) -> R,
    ) -> R {
        if self.same(other) {
            let state = self.read();
            f(&state.storage, &state.storage)
        } else {
            let lhs = self.read();
            let rhs = other.read();
            f(&lhs.storage, &rhs.storage)
        }
    }

    /// Takes the storage out of a tensor, copying it if the handle is shared.
    pub(crate) fn into_storage(self) -> Result<Storage> {
        match Arc::try_unwrap(self.0) {
            Ok(node) => Ok(node
                .state
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .storage),
            Err(shared) => Tensor(shared).deep_clone()?.into_storage(),
        }
    }

    pub(crate) fn same(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Fails unless both tensors come from the same context.
    pub(crate) fn check_context(&self, other: &Tensor, op: &'static str) -> Result<()> {
        if self.0.ctx.same(&other.0.ctx) {
            Ok(())
        } else {
            Err(TensorError::unsupported(
                op,
                "operands belong to different compute contexts",
            ))
        }
    }

    // === Accessors ===

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn context(&self) -> &ComputeContext {
        &self.0.ctx
    }

    pub fn shape(&self) -> Shape {
        self.read().storage.shape().clone()
    }

    pub fn dims(&self) -> Vec<usize> {
        self.read().storage.shape().dims().to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.read().storage.shape().ndim()
    }

    pub fn numel(&self) -> usize {
        self.read().storage.shape().numel()
    }

    pub fn device(&self) -> Device {
        self.read().storage.device()
    }

    /// Row-major copy of the contents.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let ctx = self.context();
        let state = self.read();
        dispatch_unary!(ctx, "to_vec", &state.storage, |be, x| be.to_vec(x))
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        let numel = self.numel();
        if numel != 1 {
            return Err(TensorError::unsupported(
                "item",
                format!("tensor has {numel} elements"),
            ));
        }
        self.get(&vec![0; self.ndim()])
    }

    // === Element access ===

    pub fn get(&self, index: &[usize]) -> Result<f32> {
        let ctx = self.context();
        let state = self.read();
        let linear = state.storage.shape().linear_index(index)?;
        dispatch_unary!(ctx, "get", &state.storage, |be, x| be.read_at(x, linear))
    }

    pub fn set(&self, index: &[usize], value: f32) -> Result<()> {
        self.update_at(index, |_| value)
    }

    /// Adds `delta` to the element at `index`.
    pub fn add_at(&self, index: &[usize], delta: f32) -> Result<()> {
        self.update_at(index, |old| old + delta)
    }

    fn update_at(&self, index: &[usize], f: impl Fn(f32) -> f32) -> Result<()> {
        let ctx = self.context();
        let mut guard = self.write();
        let state = &mut *guard;
        let linear = state.storage.shape().linear_index(index)?;
        match &mut state.storage {
            Storage::Cpu(t) => {
                let old = ctx.cpu().read_at(t, linear)?;
                ctx.cpu().write_at(t, linear, f(old))
            }
            Storage::Gpu(t) => {
                let attempt = ctx.gpu().and_then(|gpu| {
                    let old = gpu.read_at(t, linear)?;
                    gpu.write_at(t, linear, f(old))
                });
                match attempt {
                    Err(e) if e.is_device_failure() => {
                        ctx.note_fallback("set", &e);
                        let mut host = t.to_host()?;
                        let old = ctx.cpu().read_at(&host, linear)?;
                        ctx.cpu().write_at(&mut host, linear, f(old))?;
                        state.storage = Storage::Cpu(host);
                        Ok(())
                    }
                    other => other,
                }
            }
        }
    }

    // === Shape ===

    /// New tensor with the same data and a different shape.
    pub fn reshape(&self, dims: &[usize]) -> Result<Tensor> {
        let target = Shape::new(dims.to_vec())?;
        layout::reshape_check(&self.shape(), &target)?;
        let ctx = self.context();
        let state = self.read();
        let out: Storage = dispatch_unary!(ctx, "reshape", &state.storage, |be, x| be
            .copy(x)
            .and_then(|mut c| be.reshape_in_place(&mut c, &target).map(|()| c)))?;
        Ok(Tensor::from_storage(ctx, out))
    }

    /// Changes the shape without copying.
    pub fn reshape_in_place(&self, dims: &[usize]) -> Result<()> {
        let target = Shape::new(dims.to_vec())?;
        let ctx = self.context();
        let mut guard = self.write();
        let state = &mut *guard;
        match &mut state.storage {
            Storage::Cpu(t) => ctx.cpu().reshape_in_place(t, &target),
            Storage::Gpu(t) => match ctx.gpu().and_then(|gpu| gpu.reshape_in_place(t, &target)) {
                Err(e) if e.is_device_failure() => {
                    ctx.note_fallback("reshape_in_place", &e);
                    let mut host = t.to_host()?;
                    ctx.cpu().reshape_in_place(&mut host, &target)?;
                    state.storage = Storage::Cpu(host);
                    Ok(())
                }
                other => other,
            },
        }
    }

    // === Devices and lifetime ===

    /// Copy of this tensor on `device`.
    ///
    /// Moving to the GPU when it cannot be initialized yields a CPU copy.
    pub fn to(&self, device: Device) -> Result<Tensor> {
        let ctx = self.context();
        let state = self.read();
        let storage = match (&state.storage, device) {
            (Storage::Cpu(t), Device::Cpu) => Storage::Cpu(t.clone()),
            (Storage::Gpu(t), Device::Cpu) => Storage::Cpu(t.to_host()?),
            (Storage::Cpu(t), Device::Gpu) => match ctx.gpu().and_then(|gpu| gpu.upload(t)) {
                Ok(g) => Storage::Gpu(g),
                Err(e) if e.is_device_failure() => {
                    ctx.note_fallback("to", &e);
                    Storage::Cpu(t.clone())
                }
                Err(e) => return Err(e),
            },
            (Storage::Gpu(_), Device::Gpu) => {
                let copy: Storage =
                    dispatch_unary!(ctx, "to", &state.storage, |be, x| be.copy(x))?;
                copy
            }
        };
        Ok(Tensor::from_storage(ctx, storage))
    }

    /// Frees device memory now. Later GPU access fails with `Released`.
    ///
    /// No-op for CPU tensors.
    pub fn release(&self) {
        if let Storage::Gpu(t) = &mut self.write().storage {
            t.release();
        }
    }

    /// Independent copy without autograd history.
    pub fn deep_clone(&self) -> Result<Tensor> {
        let ctx = self.context();
        let state = self.read();
        let out: Storage = dispatch_unary!(ctx, "clone", &state.storage, |be, x| be.copy(x))?;
        Ok(Tensor::from_storage(ctx, out))
    }

    /// Tensor of this shape and device filled with `value`.
    pub fn full_like(&self, value: f32) -> Result<Tensor> {
        let ctx = self.context();
        let state = self.read();
        let shape = state.storage.shape().clone();
        let out: Storage = dispatch_unary!(ctx, "full", &state.storage, |be, _x| be
            .full(&shape, value))?;
        Ok(Tensor::from_storage(ctx, out))
    }

    pub fn zeros_like(&self) -> Result<Tensor> {
        self.full_like(0.0)
    }

    pub fn ones_like(&self) -> Result<Tensor> {
        self.full_like(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ComputeContext {
        ComputeContext::cpu_only().unwrap()
    }

    #[test]
    fn test_get_set() {
        let t = ctx().zeros(&[2, 3]).unwrap();
        t.set(&[1, 2], 5.0).unwrap();
        t.add_at(&[1, 2], 1.5).unwrap();
        assert_eq!(t.get(&[1, 2]).unwrap(), 6.5);
        assert!(matches!(
            t.get(&[2, 0]),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            t.set(&[0], 1.0),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_clone_shares_deep_clone_copies() {
        let a = ctx().ones(&[3]).unwrap();
        let shared = a.clone();
        let copy = a.deep_clone().unwrap();
        a.set(&[0], 9.0).unwrap();
        assert_eq!(shared.get(&[0]).unwrap(), 9.0);
        assert_eq!(copy.get(&[0]).unwrap(), 1.0);
        assert_ne!(a.id(), copy.id());
        assert_eq!(a.id(), shared.id());
    }

    #[test]
    fn test_reshape() {
        let a = ctx().from_values(&[2, 3], (0..6).map(|v| v as f32).collect()).unwrap();
        let b = a.reshape(&[3, 2]).unwrap();
        assert_eq!(b.dims(), vec![3, 2]);
        assert_eq!(a.dims(), vec![2, 3]);
        assert_eq!(b.get(&[2, 1]).unwrap(), 5.0);
        assert!(matches!(
            a.reshape(&[4, 2]),
            Err(TensorError::ShapeMismatch { .. })
        ));

        a.reshape_in_place(&[6]).unwrap();
        assert_eq!(a.dims(), vec![6]);
    }

    #[test]
    fn test_item() {
        let ctx = ctx();
        assert_eq!(ctx.scalar(4.0).unwrap().item().unwrap(), 4.0);
        assert!(ctx.ones(&[2]).unwrap().item().is_err());
    }

    #[test]
    fn test_to_gpu_without_gpu_stays_on_cpu() {
        let a = ctx().ones(&[2, 2]).unwrap();
        let b = a.to(Device::Gpu).unwrap();
        assert_eq!(b.device(), Device::Cpu);
        assert_eq!(b.to_vec().unwrap(), vec![1.0; 4]);
        // A no-op on the host.
        b.release();
        assert_eq!(b.to_vec().unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_full_like() {
        let a = ctx().zeros(&[2, 2]).unwrap();
        assert_eq!(a.full_like(3.0).unwrap().to_vec().unwrap(), vec![3.0; 4]);
        assert_eq!(a.ones_like().unwrap().dims(), vec![2, 2]);
    }
}
