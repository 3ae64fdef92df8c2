//! Intrusive list of operations whose listener callbacks have not run yet.
//!
//! Operations are linked through [`OperationCore::link`], so queueing a completion never
//! allocates. The list does not own its entries.
use std::ptr::NonNull;

use intrusive_collections::{container_of, linked_list, offset_of, Adapter, LinkOps, LinkedList};
use intrusive_collections::PointerOps;

use crate::operation::OperationCore;

pub(crate) struct DeferList {
    list: LinkedList<DeferAdapter>,
}

impl DeferList {
    pub(crate) fn new() -> DeferList {
        DeferList {
            list: LinkedList::new(DeferAdapter::new()),
        }
    }

    /// Queue an operation at the back of the list.
    ///
    /// # Safety
    /// The operation must stay alive and pinned until it is popped again.
    pub(crate) unsafe fn push(&mut self, operation: NonNull<OperationCore>) {
        assert!(!operation.as_ref().link.is_linked());
        self.list.push_back(operation);
    }

    pub(crate) fn pop(&mut self) -> Option<NonNull<OperationCore>> {
        self.list.pop_front()
    }
}

struct CorePointerOps;

unsafe impl PointerOps for CorePointerOps {
    type Value = OperationCore;
    type Pointer = NonNull<OperationCore>;

    unsafe fn from_raw(&self, value: *const Self::Value) -> Self::Pointer {
        NonNull::new(value as *mut Self::Value).expect("pointer cannot be null")
    }

    fn into_raw(&self, ptr: Self::Pointer) -> *const Self::Value {
        ptr.as_ptr() as *const Self::Value
    }
}

struct DeferAdapter {
    pointer_ops: CorePointerOps,
    link_ops: linked_list::LinkOps,
}

impl DeferAdapter {
    fn new() -> DeferAdapter {
        DeferAdapter {
            pointer_ops: CorePointerOps,
            link_ops: linked_list::LinkOps,
        }
    }
}

unsafe impl Adapter for DeferAdapter {
    type LinkOps = linked_list::LinkOps;
    type PointerOps = CorePointerOps;

    unsafe fn get_value(
        &self,
        link: <Self::LinkOps as LinkOps>::LinkPtr,
    ) -> *const <Self::PointerOps as PointerOps>::Value {
        container_of!(link.as_ptr(), OperationCore, link)
    }

    unsafe fn get_link(
        &self,
        value: *const <Self::PointerOps as PointerOps>::Value,
    ) -> <Self::LinkOps as LinkOps>::LinkPtr {
        if value.is_null() {
            panic!("Passed in pointer to the value can not be null");
        }
        let ptr = (value as *const u8).add(offset_of!(OperationCore, link));
        NonNull::new_unchecked(ptr as *mut _)
    }

    fn link_ops(&self) -> &Self::LinkOps {
        &self.link_ops
    }

    fn link_ops_mut(&mut self) -> &mut Self::LinkOps {
        &mut self.link_ops
    }

    fn pointer_ops(&self) -> &Self::PointerOps {
        &self.pointer_ops
    }
}
