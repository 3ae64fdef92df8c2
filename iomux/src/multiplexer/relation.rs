use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;

use ahash::AHashMap;

use crate::handle::{Connector, Handle, HandleType, IoOperation, NativeHandle};
use crate::multiplexer::{AsyncOperationImpl, Connect, OperationDescriptor, PostSynchronousCompletion};
use crate::operation::StorageRequirements;
use crate::{Error, Result};

type AttachFn = fn(&dyn Any, &NativeHandle) -> Result<Connector>;
type DetachFn = fn(&dyn Any, &NativeHandle, &Connector) -> Result<()>;

/// What one multiplexer knows about one handle type: how to attach and detach it, and a
/// descriptor for every operation on it, indexed by [`IoOperation::INDEX`].
pub struct HandleRelation {
    handle: HandleType,
    pub(crate) attach: AttachFn,
    pub(crate) detach: DetachFn,
    requirements: StorageRequirements,
    operations: Vec<OperationDescriptor>,
}

impl HandleRelation {
    pub fn handle(&self) -> HandleType {
        self.handle
    }

    /// Storage large enough for any operation on this handle type.
    pub fn requirements(&self) -> StorageRequirements {
        self.requirements
    }

    pub fn operation(&self, index: usize) -> Result<&OperationDescriptor> {
        self.operations.get(index).ok_or(Error::InvalidArgument)
    }

    pub fn operations(&self) -> &[OperationDescriptor] {
        &self.operations
    }
}

impl fmt::Debug for HandleRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRelation")
            .field("handle", &self.handle.name)
            .field("operations", &self.operations)
            .finish()
    }
}

fn attach<M, H>(multiplexer: &dyn Any, native: &NativeHandle) -> Result<Connector>
where
    M: Connect<H>,
    H: Handle,
{
    let multiplexer = multiplexer
        .downcast_ref::<M>()
        .ok_or(Error::InvalidArgument)?;
    multiplexer.attach(native)
}

fn detach<M, H>(multiplexer: &dyn Any, native: &NativeHandle, connector: &Connector) -> Result<()>
where
    M: Connect<H>,
    H: Handle,
{
    let multiplexer = multiplexer
        .downcast_ref::<M>()
        .ok_or(Error::InvalidArgument)?;
    multiplexer.detach(native, connector)
}

/// Builds the relation between multiplexer `M` and handle type `H`.
///
/// Operations must be added in [`IoOperation::INDEX`] order.
pub struct RelationBuilder<M, H> {
    operations: Vec<OperationDescriptor>,
    requirements: StorageRequirements,
    _types: PhantomData<fn() -> (M, H)>,
}

impl<M, H> RelationBuilder<M, H>
where
    M: Connect<H>,
    H: Handle,
{
    pub fn new() -> RelationBuilder<M, H> {
        RelationBuilder {
            operations: Vec::new(),
            requirements: StorageRequirements::default(),
            _types: PhantomData,
        }
    }

    fn push<O: IoOperation<Handle = H>>(mut self, descriptor: OperationDescriptor) -> Self {
        assert_eq!(
            O::INDEX,
            self.operations.len(),
            "{} registered out of order for {}",
            O::NAME,
            H::NAME
        );
        self.requirements = self.requirements.union(descriptor.requirements());
        self.operations.push(descriptor);
        self
    }

    /// Add an operation `M` implements asynchronously.
    pub fn operation<O>(self) -> Self
    where
        M: AsyncOperationImpl<O>,
        O: IoOperation<Handle = H>,
    {
        self.push::<O>(OperationDescriptor::asynchronous::<M, O>())
    }

    /// Add an operation that runs blocking and completes synchronously.
    pub fn fallback<O>(self) -> Self
    where
        M: PostSynchronousCompletion,
        O: IoOperation<Handle = H>,
    {
        self.push::<O>(OperationDescriptor::fallback::<M, O>())
    }

    pub fn build(self) -> HandleRelation {
        HandleRelation {
            handle: HandleType::of::<H>(),
            attach: attach::<M, H>,
            detach: detach::<M, H>,
            requirements: self.requirements,
            operations: self.operations,
        }
    }
}

/// All handle relations of one multiplexer type, built once per process.
#[derive(Default)]
pub struct RelationTable {
    relations: AHashMap<TypeId, HandleRelation>,
}

impl RelationTable {
    pub fn new() -> RelationTable {
        RelationTable::default()
    }

    pub fn with(mut self, relation: HandleRelation) -> RelationTable {
        self.relations.insert(relation.handle.id, relation);
        self
    }

    pub fn find(&self, handle: HandleType) -> Result<&HandleRelation> {
        self.relations
            .get(&handle.id)
            .ok_or(Error::NoHandleRelation {
                handle: handle.name,
            })
    }
}
