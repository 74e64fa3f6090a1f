// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with untrusted/unprivileged/user memory.
//!
//! The core does not implement virtual memory; it consumes an
//! [`AddressSpace`] handle per task and asks it to resolve and copy. Every
//! access is checked by the address space -- a bad user pointer surfaces as
//! `InvalidArgument`, never as a wild kernel read.
//!
//! On top of the raw byte interface sit three typed access paths:
//! little-endian scalars (via `byteorder`), fixed-layout records (via
//! `zerocopy`), and marshalled records for the "slow" syscall variants
//! (via `serde`/`ssmarshal`).

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use abi::{ErrorCode, RawMessage};
use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{AsBytes, LayoutVerified};

use crate::sync::SpinLock;

/// Physical address, the canonical identity of user memory. Futex keys are
/// physical so that aliased mappings name the same futex.
pub type PhysAddr = u64;

/// The interface the core demands of the (external) memory subsystem.
///
/// Area operations exist so the `SYS_AS_AREA_*` syscalls have somewhere to
/// delegate; implementations that do not support them return
/// `InvalidArgument`, which is also the default.
pub trait AddressSpace: Send + Sync {
    /// Translates a virtual address, or `None` if nothing is mapped there.
    fn resolve(&self, va: u64) -> Option<PhysAddr>;

    /// Copies bytes out of user memory. Fails if any byte of the range is
    /// unmapped.
    fn read_bytes(&self, va: u64, buf: &mut [u8]) -> Result<(), ErrorCode>;

    /// Copies bytes into user memory. Fails if any byte of the range is
    /// unmapped.
    fn write_bytes(&self, va: u64, buf: &[u8]) -> Result<(), ErrorCode>;

    fn area_create(
        &self,
        _base: u64,
        _size: u64,
        _flags: u32,
    ) -> Result<u64, ErrorCode> {
        Err(ErrorCode::InvalidArgument)
    }

    fn area_resize(&self, _base: u64, _size: u64) -> Result<(), ErrorCode> {
        Err(ErrorCode::InvalidArgument)
    }

    fn area_destroy(&self, _base: u64) -> Result<(), ErrorCode> {
        Err(ErrorCode::InvalidArgument)
    }

    /// Accepts an address-space area offered by another task. Handshake
    /// bookkeeping only; the transfer is the memory subsystem's business.
    fn area_accept(&self, _base: u64, _size: u64) -> Result<(), ErrorCode> {
        Err(ErrorCode::InvalidArgument)
    }

    /// Offers an address-space area to another task.
    fn area_send(&self, _base: u64, _size: u64) -> Result<(), ErrorCode> {
        Err(ErrorCode::InvalidArgument)
    }
}

/// Address space of the kernel's own task: it has no user memory, and every
/// user-memory access through it is a bug reported as `InvalidArgument`.
pub struct KernelSpace;

impl AddressSpace for KernelSpace {
    fn resolve(&self, _va: u64) -> Option<PhysAddr> {
        None
    }

    fn read_bytes(&self, _va: u64, _buf: &mut [u8]) -> Result<(), ErrorCode> {
        Err(ErrorCode::InvalidArgument)
    }

    fn write_bytes(&self, _va: u64, _buf: &[u8]) -> Result<(), ErrorCode> {
        Err(ErrorCode::InvalidArgument)
    }
}

/// Reads one little-endian machine word from user memory.
pub fn read_word(a_s: &dyn AddressSpace, va: u64) -> Result<u64, ErrorCode> {
    let mut buf = [0u8; 8];
    a_s.read_bytes(va, &mut buf)?;
    Ok(LittleEndian::read_u64(&buf))
}

/// Writes one little-endian machine word into user memory.
pub fn write_word(
    a_s: &dyn AddressSpace,
    va: u64,
    val: u64,
) -> Result<(), ErrorCode> {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, val);
    a_s.write_bytes(va, &buf)
}

/// Properly aligned staging buffer for a `RawMessage`, so the layout check
/// below never trips over stack alignment.
#[repr(align(8))]
struct MessageBuf([u8; core::mem::size_of::<RawMessage>()]);

/// Reads a fixed-layout IPC payload from user memory (the "slow" call
/// path).
pub fn read_message(
    a_s: &dyn AddressSpace,
    va: u64,
) -> Result<RawMessage, ErrorCode> {
    let mut buf = MessageBuf([0; core::mem::size_of::<RawMessage>()]);
    a_s.read_bytes(va, &mut buf.0)?;
    let lv = LayoutVerified::<_, RawMessage>::new(&buf.0[..])
        .ok_or(ErrorCode::InvalidArgument)?;
    Ok(*lv)
}

/// Writes a fixed-layout IPC payload into user memory (answer delivery).
pub fn write_message(
    a_s: &dyn AddressSpace,
    va: u64,
    msg: &RawMessage,
) -> Result<(), ErrorCode> {
    a_s.write_bytes(va, msg.as_bytes())
}

/// Unmarshals a serde record from user memory. Used by the slow syscall
/// variants whose argument is a structured record rather than scalars
/// (IRQ program registration, thread spawn records).
pub fn read_record<T: serde::de::DeserializeOwned>(
    a_s: &dyn AddressSpace,
    va: u64,
    len: usize,
) -> Result<T, ErrorCode> {
    if len > 64 * 1024 {
        return Err(ErrorCode::InvalidArgument);
    }
    let mut buf = vec![0u8; len];
    a_s.read_bytes(va, &mut buf)?;
    let (val, _) = ssmarshal::deserialize(&buf)
        .map_err(|_| ErrorCode::InvalidArgument)?;
    Ok(val)
}

/// Marshals a serde record into user memory, returning the encoded size.
pub fn write_record<T: serde::Serialize>(
    a_s: &dyn AddressSpace,
    va: u64,
    len: usize,
    val: &T,
) -> Result<usize, ErrorCode> {
    if len > 64 * 1024 {
        return Err(ErrorCode::InvalidArgument);
    }
    let mut buf = vec![0u8; len];
    let n = ssmarshal::serialize(&mut buf, val)
        .map_err(|_| ErrorCode::InvalidArgument)?;
    a_s.write_bytes(va, &buf[..n])?;
    Ok(n)
}

struct Area {
    va: u64,
    len: u64,
    pa: u64,
}

struct FlatInner {
    mem: Vec<u8>,
    areas: Vec<Area>,
}

/// Trivial [`AddressSpace`]: a flat slab of "physical" memory with a small
/// area table mapping virtual ranges onto it. This is the address space of
/// the hosted machine; two tasks sharing an Arc of one share memory, and
/// two areas with the same physical base model an aliased mapping.
pub struct FlatSpace {
    inner: SpinLock<FlatInner>,
}

impl FlatSpace {
    /// Creates a space with `phys_size` bytes of backing memory and no
    /// mappings.
    pub fn new(phys_size: usize) -> Self {
        FlatSpace {
            inner: SpinLock::new(FlatInner {
                mem: vec![0; phys_size],
                areas: Vec::new(),
            }),
        }
    }

    /// Maps `[va, va+len)` onto physical `[pa, pa+len)`. Harness-side
    /// setup; overlapping virtual ranges are a harness bug.
    pub fn map(&self, va: u64, pa: u64, len: u64) -> Result<(), ErrorCode> {
        let mut inner = self.inner.lock();
        if pa + len > inner.mem.len() as u64 {
            return Err(ErrorCode::NoMemory);
        }
        if inner
            .areas
            .iter()
            .any(|a| va < a.va + a.len && a.va < va + len)
        {
            return Err(ErrorCode::InvalidArgument);
        }
        inner.areas.push(Area { va, len, pa });
        Ok(())
    }

    /// Atomic read-modify-write on a user word, for harness code playing
    /// the part of userspace `atomic_inc`/`atomic_dec`. Returns the *new*
    /// value.
    pub fn fetch_add(&self, va: u64, delta: i64) -> Result<u64, ErrorCode> {
        let mut inner = self.inner.lock();
        let pa = flat_resolve(&inner, va, 8)?;
        let range = pa as usize..pa as usize + 8;
        let old = LittleEndian::read_u64(&inner.mem[range.clone()]);
        let new = old.wrapping_add(delta as u64);
        LittleEndian::write_u64(&mut inner.mem[range], new);
        Ok(new)
    }
}

fn flat_resolve(
    inner: &FlatInner,
    va: u64,
    len: u64,
) -> Result<u64, ErrorCode> {
    inner
        .areas
        .iter()
        .find(|a| va >= a.va && va + len <= a.va + a.len)
        .map(|a| a.pa + (va - a.va))
        .ok_or(ErrorCode::InvalidArgument)
}

impl AddressSpace for FlatSpace {
    fn resolve(&self, va: u64) -> Option<PhysAddr> {
        let inner = self.inner.lock();
        flat_resolve(&inner, va, 1).ok()
    }

    fn read_bytes(&self, va: u64, buf: &mut [u8]) -> Result<(), ErrorCode> {
        if buf.is_empty() {
            return Ok(());
        }
        let inner = self.inner.lock();
        let pa = flat_resolve(&inner, va, buf.len() as u64)? as usize;
        buf.copy_from_slice(&inner.mem[pa..pa + buf.len()]);
        Ok(())
    }

    fn write_bytes(&self, va: u64, buf: &[u8]) -> Result<(), ErrorCode> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let pa = flat_resolve(&inner, va, buf.len() as u64)? as usize;
        inner.mem[pa..pa + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn area_create(
        &self,
        base: u64,
        size: u64,
        _flags: u32,
    ) -> Result<u64, ErrorCode> {
        if size == 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        let pa = {
            let inner = self.inner.lock();
            let used: u64 = inner.areas.iter().map(|a| a.len).sum();
            if used + size > inner.mem.len() as u64 {
                return Err(ErrorCode::NoMemory);
            }
            used
        };
        self.map(base, pa, size)?;
        Ok(base)
    }

    fn area_resize(&self, base: u64, size: u64) -> Result<(), ErrorCode> {
        let mut inner = self.inner.lock();
        let mem_len = inner.mem.len() as u64;
        let a = inner
            .areas
            .iter_mut()
            .find(|a| a.va == base)
            .ok_or(ErrorCode::NotFound)?;
        if size == 0 || a.pa + size > mem_len {
            return Err(ErrorCode::InvalidArgument);
        }
        a.len = size;
        Ok(())
    }

    fn area_destroy(&self, base: u64) -> Result<(), ErrorCode> {
        let mut inner = self.inner.lock();
        let pos = inner
            .areas
            .iter()
            .position(|a| a.va == base)
            .ok_or(ErrorCode::NotFound)?;
        inner.areas.remove(pos);
        Ok(())
    }

    fn area_accept(&self, _base: u64, _size: u64) -> Result<(), ErrorCode> {
        Ok(())
    }

    fn area_send(&self, _base: u64, _size: u64) -> Result<(), ErrorCode> {
        Ok(())
    }
}

/// Convenience: a shared flat space with one identity-style mapping, which
/// is all most harnesses need.
pub fn flat_space(va_base: u64, size: u64) -> Arc<FlatSpace> {
    let s = FlatSpace::new(size as usize);
    s.map(va_base, 0, size).expect("fresh space cannot overlap");
    Arc::new(s)
}
