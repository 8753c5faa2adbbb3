//! Message-buffer pool wrapper: adds NIC registration on top of
//! `nexus-rpc-alloc`'s slab pool so every allocated buffer's payload is
//! NIC-addressable via a registered region.

use std::collections::HashMap;

use nexus_rpc_alloc::{MsgBuffer, SlabPool};
use nexus_rpc_transport::{LKey, Transport};

use crate::error::{Result, RpcError};

pub struct BufferPool {
    slab: SlabPool,
    lkeys: HashMap<MsgBuffer, LKey>,
}

impl BufferPool {
    pub fn new(capacity: usize, max_len: usize) -> Self {
        Self { slab: SlabPool::new(capacity, max_len), lkeys: HashMap::new() }
    }

    /// Allocates `len` bytes and registers the backing region with
    /// `transport`. A freed buffer's registration entry is dropped in
    /// [`Self::free`]; it is never referenced by an in-flight packet again
    /// once removed.
    pub fn alloc<T: Transport>(&mut self, len: usize, transport: &mut T) -> Result<MsgBuffer> {
        let buf = self.slab.alloc(len).map_err(RpcError::from)?;
        let lkey = transport.register(self.slab.as_slice(buf, len)?);
        self.lkeys.insert(buf, lkey);
        Ok(buf)
    }

    pub fn resize(&mut self, buf: MsgBuffer, new_len: usize) -> Result<()> {
        self.slab.resize(buf, new_len).map_err(RpcError::from)
    }

    pub fn free(&mut self, buf: MsgBuffer) -> Result<()> {
        self.lkeys.remove(&buf);
        self.slab.free(buf).map_err(RpcError::from)
    }

    pub fn as_slice(&self, buf: MsgBuffer, len: usize) -> Result<&[u8]> {
        self.slab.as_slice(buf, len).map_err(RpcError::from)
    }

    pub fn as_mut_slice(&mut self, buf: MsgBuffer, len: usize) -> Result<&mut [u8]> {
        self.slab.as_mut_slice(buf, len).map_err(RpcError::from)
    }

    pub fn lkey(&self, buf: MsgBuffer) -> Option<LKey> {
        self.lkeys.get(&buf).copied()
    }
}
