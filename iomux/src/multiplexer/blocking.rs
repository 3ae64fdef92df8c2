use std::any::Any;
use std::cell::RefCell;
use std::ptr::NonNull;

use lazy_static::lazy_static;

use crate::deadline::Deadline;
use crate::handle::{
    Connector, EventHandle, FileHandle, Flush, GatherWriteAt, Handle, HandleType,
    ListenSocketHandle, NativeHandle, ScatterReadAt, Signal, SocketHandle, StreamAccept,
    StreamConnect, StreamRead, StreamWrite, Wait,
};
use crate::multiplexer::{
    Connect, HandleRelation, Multiplexer, PostSynchronousCompletion, PumpMode, PumpStatistics,
    RelationBuilder, RelationTable,
};
use crate::operation::{complete, flush, DeferList, OperationCore};
use crate::Result;

lazy_static! {
    static ref RELATIONS: RelationTable = RelationTable::new()
        .with(
            RelationBuilder::<BlockingMultiplexer, FileHandle>::new()
                .fallback::<ScatterReadAt>()
                .fallback::<GatherWriteAt>()
                .fallback::<Flush>()
                .build()
        )
        .with(
            RelationBuilder::<BlockingMultiplexer, SocketHandle>::new()
                .fallback::<StreamRead>()
                .fallback::<StreamWrite>()
                .fallback::<StreamConnect>()
                .build()
        )
        .with(
            RelationBuilder::<BlockingMultiplexer, ListenSocketHandle>::new()
                .fallback::<StreamAccept>()
                .build()
        )
        .with(
            RelationBuilder::<BlockingMultiplexer, EventHandle>::new()
                .fallback::<Wait>()
                .fallback::<Signal>()
                .build()
        );
}

/// A multiplexer without a kernel completion mechanism.
///
/// Every operation runs blocking when it is started and completes synchronously; listeners are
/// notified by the next pump.
pub struct BlockingMultiplexer {
    deferred: RefCell<DeferList>,
}

impl BlockingMultiplexer {
    pub fn new() -> BlockingMultiplexer {
        BlockingMultiplexer {
            deferred: RefCell::new(DeferList::new()),
        }
    }
}

impl Default for BlockingMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer for BlockingMultiplexer {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn find_handle_relation(&self, handle: HandleType) -> Result<&'static HandleRelation> {
        RELATIONS.find(handle)
    }

    fn pump(&self, mode: PumpMode, _deadline: Deadline) -> Result<PumpStatistics> {
        let mut stats = PumpStatistics::default();
        // Nothing can complete while waiting, so the deadline never applies.
        if mode.contains(PumpMode::FLUSH) {
            let concluded = unsafe { flush(&self.deferred) };
            stats.completed += concluded;
            stats.concluded += concluded;
        }
        Ok(stats)
    }
}

impl PostSynchronousCompletion for BlockingMultiplexer {
    unsafe fn post_synchronous_completion(&self, operation: NonNull<OperationCore>, result: Result<()>) {
        complete(operation, result, &self.deferred);
    }
}

impl<H: Handle> Connect<H> for BlockingMultiplexer {
    fn attach(&self, _native: &NativeHandle) -> Result<Connector> {
        Ok(Connector::Blocking)
    }

    fn detach(&self, _native: &NativeHandle, _connector: &Connector) -> Result<()> {
        Ok(())
    }
}
