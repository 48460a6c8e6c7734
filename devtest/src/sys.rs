// Copyright 2026 Oxide Computer Company

//! Raw Linux native AIO interface, from `<linux/aio_abi.h>`.
//!
//! libc does not carry these, and the libaio userspace wrapper only adds a
//! layer over the same four system calls, so we declare the ABI ourselves.

#![allow(non_camel_case_types)]

use libc::{c_long, c_uint, c_ulong};
use static_assertions::assert_eq_size;

pub type aio_context_t = c_ulong;

pub const IOCB_CMD_PREAD: u16 = 0;
pub const IOCB_CMD_PWRITE: u16 = 1;

/*
 * Set in aio_flags when aio_resfd holds an eventfd that the kernel should
 * bump on completion.
 */
pub const IOCB_FLAG_RESFD: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct iocb {
    /* returned unchanged in io_event.data */
    pub aio_data: u64,

    #[cfg(target_endian = "little")]
    pub aio_key: u32,
    pub aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    pub aio_key: u32,

    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,

    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,

    pub aio_reserved2: u64,

    pub aio_flags: u32,
    pub aio_resfd: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct io_event {
    /* the aio_data from the iocb */
    pub data: u64,
    /* what iocb this event came from */
    pub obj: u64,
    /* result code for this event */
    pub res: i64,
    /* secondary result */
    pub res2: i64,
}

assert_eq_size!(iocb, [u8; 64]);
assert_eq_size!(io_event, [u8; 32]);

pub unsafe fn io_setup(nr_events: c_uint, ctxp: *mut aio_context_t) -> c_long {
    libc::syscall(libc::SYS_io_setup, nr_events, ctxp)
}

pub unsafe fn io_destroy(ctx: aio_context_t) -> c_long {
    libc::syscall(libc::SYS_io_destroy, ctx)
}

pub unsafe fn io_submit(
    ctx: aio_context_t,
    nr: c_long,
    iocbpp: *mut *mut iocb,
) -> c_long {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp)
}

pub unsafe fn io_getevents(
    ctx: aio_context_t,
    min_nr: c_long,
    nr: c_long,
    events: *mut io_event,
    timeout: *mut libc::timespec,
) -> c_long {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout)
}
