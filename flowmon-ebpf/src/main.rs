#![no_std]
#![no_main]

// Flow metrics generator for TC ingress/egress hooks.
//
// 1) Flows are aggregated in a per-CPU hash map, keyed by FlowId.
// 2) Userspace periodically drains the map and merges the per-CPU views.
// 3) When a new flow can't be inserted (map full or busy), the single-packet
//    flow goes to userspace through the DIRECT_FLOWS ring buffer instead.

use aya_ebpf::{
    bindings::{BPF_ANY, TC_ACT_OK},
    helpers::{bpf_get_prandom_u32, bpf_ktime_get_ns},
    macros::{classifier, map},
    maps::{PerCpuHashMap, PerfEventArray, RingBuf},
    programs::TcContext,
};
use aya_log_ebpf::{debug, warn};
use flowmon_common::{
    cursor::HeaderCursor, parse::build_flow_id, payload, Direction, FlowId, FlowMetrics,
    FlowRecord, PayloadMeta, AGGREGATED_FLOWS_MAX_ENTRIES, DIRECT_FLOWS_BYTE_SIZE,
};

// Rewritten by userspace at load time.
#[no_mangle]
static SAMPLING: u32 = 0;
#[no_mangle]
static TRACE_MESSAGES: u8 = 0;

#[map]
static AGGREGATED_FLOWS: PerCpuHashMap<FlowId, FlowMetrics> =
    PerCpuHashMap::with_max_entries(AGGREGATED_FLOWS_MAX_ENTRIES, 0);

#[map]
static DIRECT_FLOWS: RingBuf = RingBuf::with_byte_size(DIRECT_FLOWS_BYTE_SIZE, 0);

#[map]
static PACKET_PAYLOADS: PerfEventArray<PayloadMeta> = PerfEventArray::new(0);

#[classifier]
pub fn ingress_flow_parse(ctx: TcContext) -> i32 {
    flow_monitor(&ctx, Direction::Ingress);
    TC_ACT_OK
}

#[classifier]
pub fn egress_flow_parse(ctx: TcContext) -> i32 {
    flow_monitor(&ctx, Direction::Egress);
    TC_ACT_OK
}

#[classifier]
pub fn ingress_payload_parse(ctx: TcContext) -> i32 {
    export_packet_payload(&ctx);
    TC_ACT_OK
}

#[classifier]
pub fn egress_payload_parse(ctx: TcContext) -> i32 {
    export_packet_payload(&ctx);
    TC_ACT_OK
}

#[inline(always)]
fn sampling() -> u32 {
    unsafe { core::ptr::read_volatile(&SAMPLING) }
}

#[inline(always)]
fn trace_messages() -> bool {
    unsafe { core::ptr::read_volatile(&TRACE_MESSAGES) != 0 }
}

#[inline(always)]
fn cursor(ctx: &TcContext) -> HeaderCursor<'_> {
    unsafe { HeaderCursor::from_raw(ctx.data() as *const u8, ctx.data_end() as *const u8) }
}

#[inline(always)]
fn if_index(ctx: &TcContext) -> u32 {
    unsafe { (*ctx.skb.skb).ifindex }
}

fn flow_monitor(ctx: &TcContext, direction: Direction) {
    // with sampling set, only 1 out of "sampling" packets is parsed
    let sampling = sampling();
    if sampling != 0 && unsafe { bpf_get_prandom_u32() } % sampling != 0 {
        return;
    }

    let parsed = match build_flow_id(&cursor(ctx), direction, if_index(ctx)) {
        Ok(parsed) => parsed,
        Err(_) => return,
    };
    let id = parsed.id;
    let now = unsafe { bpf_ktime_get_ns() };
    let len = ctx.len() as u64;

    if let Some(aggregate_flow) = AGGREGATED_FLOWS.get_ptr_mut(&id) {
        let aggregate_flow = unsafe { &mut *aggregate_flow };
        aggregate_flow.accumulate(len, now, parsed.flags, parsed.conn_tstamp);
        if let Err(ret) = AGGREGATED_FLOWS.insert(&id, aggregate_flow, BPF_ANY as u64) {
            // Usually -EBUSY. The flow is not resubmitted through the ring buffer:
            // that would create a duplicated union of partially aggregated flows.
            if trace_messages() {
                warn!(ctx, "error updating flow {}", ret);
            }
        }
        return;
    }

    let mut new_flow = FlowMetrics::new_flow(len, now, parsed.flags, parsed.conn_tstamp);
    // another CPU might be inserting the same flow concurrently, hence BPF_ANY
    if let Err(ret) = AGGREGATED_FLOWS.insert(&id, &new_flow, BPF_ANY as u64) {
        // Usually -EBUSY or -E2BIG. The single-packet flow is sent to userspace,
        // where the repeated intersection can be re-aggregated.
        if trace_messages() {
            debug!(ctx, "error adding flow {}", ret);
        }
        new_flow.errno = (-ret) as u8;
        match DIRECT_FLOWS.reserve::<FlowRecord>(0) {
            Some(mut entry) => {
                entry.write(FlowRecord {
                    id,
                    metrics: new_flow,
                });
                entry.submit(0);
            }
            None => {
                if trace_messages() {
                    warn!(ctx, "couldn't reserve space in the ringbuf, dropping flow");
                }
            }
        }
    }
}

fn export_packet_payload(ctx: &TcContext) {
    if let Some(meta) = payload::sample(&cursor(ctx), if_index(ctx)) {
        // the upper 32 flag bits ask the kernel to append that many packet bytes
        PACKET_PAYLOADS.output(ctx, &meta, meta.pkt_len);
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
