use std::collections::BTreeMap;
use std::fs::File;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::block::RefBlock;
use crate::client::{
    Client, ClientOps, ClientSignal, RequestInfo, CLIENT_AUTHENTICATED, CLIENT_HIJACKER,
};
use crate::format::{CodecType, FormatAdapter, StreamDetails};
use crate::hub::Hub;
use crate::queue::SourceQueue;
use crate::rate::Rate;
use crate::util;
use crate::worker::{self, Disposition, WorkerHandle};

pub const SOURCE_RUNNING: u32 = 1 << 0;
pub const SOURCE_ON_DEMAND: u32 = 1 << 1;
pub const SOURCE_TERMINATING: u32 = 1 << 2;
/// A coordinated listener transition (fallback or termination) is in
/// progress; cleared when the last listener has acknowledged.
pub const SOURCE_LISTENERS_SYNC: u32 = 1 << 3;
pub const SOURCE_PAUSE_LISTENERS: u32 = 1 << 4;
pub const SOURCE_TIMEOUT: u32 = 1 << 5;
pub const SOURCE_SHOUTCAST_COMPAT: u32 = 1 << 6;

/// Where this mount's listeners go when it dies.
#[derive(Debug, Clone, Default)]
pub struct FallbackInfo {
    pub mount: Option<String>,
    /// Bitrate hint in bytes per second, for file-served fallbacks.
    pub limit: u64,
    pub codec: Option<CodecType>,
}

pub struct ProducerRef {
    pub signal: Arc<ClientSignal>,
    pub id: u64,
}

pub struct ListenerEntry {
    pub signal: Arc<ClientSignal>,
    pub username: Option<String>,
}

pub struct Source {
    pub mount: String,
    pub inner: Mutex<SourceInner>,
}

pub struct SourceInner {
    pub flags: u32,
    pub queue: SourceQueue,
    pub format: Option<Box<dyn FormatAdapter>>,
    pub producer: Option<ProducerRef>,
    pub listeners: BTreeMap<u64, ListenerEntry>,
    pub listener_count: u64,
    pub prev_listeners: i64,
    pub peak_listeners: u64,
    /// Listeners still to acknowledge the current sync step.
    pub termination_count: u64,
    /// Engine-ms anchor of the sync step, for the 1500 ms force-out.
    pub timer_start_ms: u64,
    /// Engine-seconds of the last successful producer read.
    pub last_read: u64,
    pub timeout_secs: u64,
    /// Producer poll backoff while the socket is quiet.
    pub skip_duration_ms: u64,
    pub stats_interval: u64,
    pub client_stats_update: u64,
    pub worker_balance_recheck: u64,
    /// Producer ingest cap, bits per second. 0 = off.
    pub limit_rate: u64,
    /// Rolling producer rate, bytes per second.
    pub incoming_rate: u64,
    /// Per-tick listener write budget, bytes.
    pub listener_send_trigger: u64,
    pub bytes_read_since_update: u64,
    pub bytes_sent_since_update: u64,
    pub total_bytes_sent: u64,
    pub in_rate: Rate,
    pub out_rate: Rate,
    pub fallback: FallbackInfo,
    pub intro_file: Option<File>,
    pub dump_file: Option<File>,
    pub dump_filename: Option<String>,
    pub audio_info: BTreeMap<String, String>,
    pub details: StreamDetails,
    pub yp_public: bool,
    pub wait_time: u64,
    /// Total bytes the producer has pushed through the queue.
    pub producer_queue_pos: u64,
    /// The producer's next tick deadline, for end-of-queue listeners.
    pub producer_sched_ms: u64,
    pub producer_con_time: u64,
    pub on_connect: Option<String>,
    pub on_disconnect: Option<String>,
}

impl Source {
    pub fn new(mount: &str) -> Arc<Self> {
        Arc::new(Self {
            mount: mount.to_string(),
            inner: Mutex::new(SourceInner {
                flags: 0,
                queue: SourceQueue::new(),
                format: None,
                producer: None,
                listeners: BTreeMap::new(),
                listener_count: 0,
                prev_listeners: -1,
                peak_listeners: 0,
                termination_count: 0,
                timer_start_ms: 0,
                last_read: 0,
                timeout_secs: 10,
                skip_duration_ms: 80,
                stats_interval: 5,
                client_stats_update: 0,
                worker_balance_recheck: 0,
                limit_rate: 0,
                incoming_rate: 0,
                listener_send_trigger: 10_000,
                bytes_read_since_update: 0,
                bytes_sent_since_update: 0,
                total_bytes_sent: 0,
                in_rate: Rate::new(60),
                out_rate: Rate::new(9000),
                fallback: FallbackInfo::default(),
                intro_file: None,
                dump_file: None,
                dump_filename: None,
                audio_info: BTreeMap::new(),
                details: StreamDetails {
                    mount: mount.to_string(),
                    ..StreamDetails::default()
                },
                yp_public: false,
                wait_time: 0,
                producer_queue_pos: 0,
                producer_sched_ms: 0,
                producer_con_time: 0,
                on_connect: None,
                on_disconnect: None,
            }),
        })
    }
}

pub fn source_running(inner: &SourceInner) -> bool {
    inner.flags & SOURCE_RUNNING != 0
}

/// A source a listener can be placed on: it has a producer and is not
/// on its way out.
pub fn source_available(inner: &SourceInner) -> bool {
    inner.producer.is_some() && inner.flags & SOURCE_TERMINATING == 0
}

pub fn find_listener<'a>(inner: &'a SourceInner, id: u64) -> Option<&'a ListenerEntry> {
    inner.listeners.get(&id)
}

/// An override that must run after the source lock is dropped; applying
/// it locks another source.
pub struct OverrideReq {
    pub mount: String,
    pub dest: String,
    pub codec: CodecType,
}

enum ReadOutcome {
    Done,
    Moved(Arc<WorkerHandle>),
}

/// Producer tick while the source is running: drain the socket into the
/// queue, maintain the burst window, trim, publish stats, consult the
/// balancer.
fn source_read(
    hub: &Arc<Hub>,
    worker: &Arc<WorkerHandle>,
    client: &mut Client,
    source: &Arc<Source>,
    inner: &mut SourceInner,
) -> ReadOutcome {
    let now_sec = worker.time_sec();
    let now_ms = worker.time_ms();
    let mut skip = true;

    client.schedule_ms = now_ms;

    'tick: {
        if !hub.is_running() {
            inner.flags &= !SOURCE_RUNNING;
        }
        if inner.flags & SOURCE_LISTENERS_SYNC != 0 {
            if inner.termination_count > 0 {
                if inner.timer_start_ms + 1500 < now_ms {
                    inner.flags &= !(SOURCE_RUNNING | SOURCE_LISTENERS_SYNC);
                    warn!("stopping {} as sync mode lasted too long", source.mount);
                }
                client.schedule_ms = now_ms + 30;
                inner.producer_sched_ms = client.schedule_ms;
                return ReadOutcome::Done;
            }
            if let Some(dest) = inner.fallback.mount.take() {
                debug!("listeners have now moved to {dest}");
            }
            inner.flags &= !SOURCE_LISTENERS_SYNC;
        }
        if inner.listener_count == 0 {
            inner.out_rate.add(0, now_ms);
        }
        if inner.prev_listeners != inner.listener_count as i64 {
            info!(
                "listener count on {} now {}",
                source.mount, inner.listener_count
            );
            inner.prev_listeners = inner.listener_count as i64;
            let count = inner.listener_count;
            hub.stats.update_mount(&source.mount, |m| m.listeners = count);
            if inner.listener_count > inner.peak_listeners {
                inner.peak_listeners = inner.listener_count;
                let peak = inner.peak_listeners;
                hub.stats
                    .update_mount(&source.mount, |m| m.listener_peak = peak);
            }
        }
        if now_sec >= inner.client_stats_update {
            update_source_stats(hub, &source.mount, inner, now_sec);
            inner.client_stats_update = now_sec + inner.stats_interval;
        }
        if now_sec >= inner.worker_balance_recheck {
            let recheck = hub.source_count().max(6);
            inner.worker_balance_recheck = now_sec + recheck;
            if let Some(target) = worker::source_change_worker(hub, worker, inner.listener_count) {
                return ReadOutcome::Moved(target);
            }
        }

        let readable = match client.io.poll_readable() {
            Ok(r) => r,
            Err(_) => {
                warn!("Error while waiting on socket, disconnecting {}", source.mount);
                inner.flags &= !SOURCE_RUNNING;
                break 'tick;
            }
        };
        if !readable {
            if inner.last_read + 3 == now_sec {
                warn!("Nothing received on {} for 3 seconds", source.mount);
            }
            if inner.last_read + inner.timeout_secs < now_sec {
                warn!("Disconnecting {} due to socket timeout", source.mount);
                inner.flags &= !SOURCE_RUNNING;
                inner.flags |= SOURCE_TIMEOUT;
                skip = false;
                break 'tick;
            }
            inner.skip_duration_ms = ((inner.skip_duration_ms as f64 * 1.3) as u64).min(400);
            break 'tick;
        }
        inner.skip_duration_ms = ((inner.skip_duration_ms as f64 * 0.9) as u64).max(10);
        inner.last_read = now_sec;

        let mut pulls = 2;
        loop {
            let SourceInner {
                format,
                queue,
                flags,
                bytes_read_since_update,
                producer_queue_pos,
                in_rate,
                dump_file,
                ..
            } = &mut *inner;
            let Some(fmt) = format.as_mut() else {
                break;
            };
            match fmt.get_buffer(client.io.as_mut()) {
                Ok(Some(block)) => {
                    let len = block.len() as u64;
                    *bytes_read_since_update += len;
                    in_rate.add(len, now_ms);
                    if let Err(e) = queue.append(block.clone()) {
                        error!("queue oddity on {}: {e}, dropping source", source.mount);
                        *flags &= !SOURCE_RUNNING;
                    }
                    *producer_queue_pos += len;
                    if let Some(df) = dump_file.as_mut() {
                        if let Err(e) = fmt.write_to_file(df, &block) {
                            warn!("disabling dump file for {} ({e})", source.mount);
                            *dump_file = None;
                        }
                    }
                    skip = false;
                }
                Ok(None) => {
                    if client.connection.error {
                        info!("End of Stream {}", source.mount);
                        *flags &= !SOURCE_RUNNING;
                        skip = false;
                    }
                    break;
                }
                Err(e) => {
                    warn!("stream read problem on {} ({e})", source.mount);
                    client.connection.error = true;
                    *flags &= !SOURCE_RUNNING;
                    skip = false;
                    break;
                }
            }
            pulls -= 1;
            if pulls == 0 {
                break;
            }
        }

        inner.queue.trim();
    }

    client.schedule_ms = now_ms
        + if skip {
            inner.skip_duration_ms | 0x0F
        } else {
            15
        };
    inner.producer_sched_ms = client.schedule_ms;
    ReadOutcome::Done
}

/// Zero every listener's deadline and prod their workers. Logs any
/// listener whose deadline had drifted well ahead of the producer's.
pub fn wakeup_listeners(hub: &Arc<Hub>, mount: &str, inner: &SourceInner) {
    let mut worker_ids: Vec<usize> = Vec::new();
    for entry in inner.listeners.values() {
        let due = entry.signal.next_due_ms.load(Ordering::Acquire);
        if inner.producer_sched_ms + 100 < due {
            debug!(
                "listener on {mount} was ahead by {}",
                due - inner.producer_sched_ms
            );
        }
        entry.signal.wake.store(true, Ordering::Release);
        let wid = entry.signal.worker.load(Ordering::Acquire);
        if !worker_ids.contains(&wid) {
            worker_ids.push(wid);
        }
    }
    for wid in worker_ids {
        if let Some(w) = hub.pool.get(wid) {
            w.wakeup();
        }
    }
}

/// Producer tick entry: duration/rate limits while running, the
/// terminating handshake otherwise.
pub fn producer_tick(hub: &Arc<Hub>, worker: &Arc<WorkerHandle>, client: &mut Client) -> Disposition {
    client.fold_signals();
    if client.signal.deposed.load(Ordering::Acquire) {
        info!("source client from {} hijacked", client.connection.ip);
        client.connection.sent_bytes = client.signal.deposed_read_bytes.load(Ordering::Acquire);
        client.clear_flag(CLIENT_AUTHENTICATED);
        return Disposition::Release;
    }
    let Some(source) = client.source.clone() else {
        return Disposition::Release;
    };
    let now_sec = worker.time_sec();
    let now_ms = worker.time_ms();

    let mut inner = source.inner.lock();
    if client.connection.discon_time != 0 && client.connection.discon_time <= now_sec {
        inner.flags &= !SOURCE_RUNNING;
        info!("streaming duration expired on {}", source.mount);
    }
    if source_running(&inner) {
        if inner.limit_rate > 0 {
            inner.incoming_rate = inner.in_rate.avg();
            if inner.limit_rate < 8 * inner.incoming_rate {
                inner.in_rate.add(0, now_ms);
                client.schedule_ms = now_ms + 110;
                return Disposition::Continue;
            }
        }
        match source_read(hub, worker, client, &source, &mut inner) {
            ReadOutcome::Done => Disposition::Continue,
            ReadOutcome::Moved(target) => Disposition::Move(target),
        }
    } else {
        if inner.flags & SOURCE_TERMINATING == 0 {
            source_shutdown(hub, &source, &mut inner, true, now_ms);
        }
        if inner.termination_count > 0 && inner.termination_count <= inner.listener_count {
            if inner.timer_start_ms + 1500 < now_ms {
                warn!(
                    "{} listeners still to process in terminating {}",
                    inner.termination_count, source.mount
                );
                inner.flags &= !SOURCE_TERMINATING;
            } else {
                debug!(
                    "{} waiting ({}, {})",
                    source.mount, inner.termination_count, inner.listener_count
                );
            }
            client.schedule_ms = now_ms + 100;
            Disposition::Continue
        } else if inner.listener_count > 0 {
            info!("listeners on terminating source {}, rechecking", source.mount);
            inner.termination_count = inner.listener_count;
            inner.timer_start_ms = now_ms;
            inner.flags &= !SOURCE_PAUSE_LISTENERS;
            inner.flags |= SOURCE_LISTENERS_SYNC;
            wakeup_listeners(hub, &source.mount, &inner);
            client.schedule_ms = now_ms + 100;
            Disposition::Continue
        } else {
            info!("no more listeners on {}", source.mount);
            hub.stats.update_mount(&source.mount, |m| m.listeners = 0);
            client.connection.discon_time = 0;
            client.ops = ClientOps::SourceTerminate;
            inner.fallback.mount = None;
            inner.flags &= !SOURCE_LISTENERS_SYNC;
            client.schedule_ms = now_ms;
            Disposition::Continue
        }
    }
}

/// Producer handshake: push out `HTTP/1.0 200 OK` then drop into the
/// read loop.
pub fn http_send_tick(
    hub: &Arc<Hub>,
    worker: &Arc<WorkerHandle>,
    client: &mut Client,
) -> Disposition {
    client.fold_signals();
    if let Some(buf) = client.refbuf.clone() {
        if client.pos < buf.len() {
            crate::format::generic_write_to_client(client);
            if client.pos < buf.len() && !client.connection.error {
                client.schedule_ms = worker.time_ms() + 30;
                return Disposition::Continue;
            }
        }
        // response done; restore any stream data read in with the headers
        let leftover = buf.take_next();
        client.refbuf = leftover;
        client.pos = client.intro_offset.max(0) as usize;
        client.intro_offset = 0;
    }
    source_client_callback(hub, worker, client)
}

/// First producer tick after the handshake: account the connection and
/// initialise the stream unless it is already live (hijack).
pub fn source_client_callback(
    hub: &Arc<Hub>,
    worker: &Arc<WorkerHandle>,
    client: &mut Client,
) -> Disposition {
    let Some(source) = client.source.clone() else {
        return Disposition::Release;
    };
    if client.connection.error {
        // handshake never made it out
        hub.dec_sources();
        return source_client_release(hub, client, &source);
    }
    if let Some(agent) = client.parser.header("user-agent") {
        let agent = agent.to_string();
        hub.stats
            .update_mount(&source.mount, |m| m.user_agent = Some(agent));
    }
    hub.stats.update_global(|g| g.source_client_connections += 1);
    client.set_queue(None);
    client.ops = ClientOps::SourceRead;

    let deferred = {
        let mut inner = source.inner.lock();
        if source_running(&inner) {
            hub.stats.update_global(|g| g.source_total_connections += 1);
            None
        } else {
            source_init(hub, &source, &mut inner, client, worker)
        }
    };
    if let Some(req) = deferred {
        set_override(hub, &req);
    }
    client.schedule_ms = worker.time_ms();
    Disposition::Continue
}

/// Prepare a reserved source for streaming: dump file, stats seeds,
/// audio-info, rate meters, stream duration, connect script. Returns the
/// override request to run once the lock is gone.
pub fn source_init(
    hub: &Arc<Hub>,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    client: &mut Client,
    worker: &Arc<WorkerHandle>,
) -> Option<OverrideReq> {
    let now_sec = worker.time_sec();

    if let Some(name) = inner.dump_filename.clone() {
        info!("dumpfile \"{name}\" for {}", source.mount);
        match std::fs::OpenOptions::new().create(true).append(true).open(&name) {
            Ok(f) => inner.dump_file = Some(f),
            Err(e) => warn!("Cannot open dump file \"{name}\" for appending: {e}, disabling"),
        }
    }

    hub.stats.update_global(|g| g.source_total_connections += 1);
    let contenttype = inner
        .format
        .as_ref()
        .map(|f| f.contenttype().to_string());
    let ip = client.connection.ip.clone();
    let session = uuid::Uuid::new_v4().to_string();
    hub.stats.update_mount(&source.mount, |m| {
        m.slow_listeners = 0;
        m.listener_peak = 0;
        m.listener_connections = 0;
        m.server_type = contenttype;
        m.stream_start = Some(chrono::Local::now());
        m.source_ip = Some(ip);
        m.session_id = Some(session);
    });

    inner.last_read = now_sec;
    inner.prev_listeners = -1;
    inner.bytes_sent_since_update = 0;
    inner.stats_interval = 5;
    // first averaged figures after 3 seconds
    inner.client_stats_update = now_sec + 3;
    inner.worker_balance_recheck = now_sec + 20;
    inner.skip_duration_ms = 80;
    inner.producer_con_time = client.connection.con_time.max(1);

    inner.audio_info.clear();
    if let Some(s) = client.parser.header("ice-audio-info") {
        let s = s.to_string();
        parse_audio_info(hub, &source.mount, inner, &s);
    }
    inner.in_rate = Rate::new(60);
    inner.out_rate = Rate::new(9000);

    inner.flags |= SOURCE_RUNNING;

    let mut deferred = None;
    let config = hub.config();
    if let Some(mcfg) = config.find_mount(&source.mount) {
        if mcfg.max_stream_duration > 0 {
            client.connection.discon_time = now_sec + mcfg.max_stream_duration;
        }
        if let Some(script) = &mcfg.on_connect {
            crate::hooks::run_script(script, &source.mount);
        }
        hub.hooks.auth.stream_start(&source.mount);
        if mcfg.fallback_override {
            if let (Some(fb), Some(fmt)) = (&mcfg.fallback_mount, &inner.format) {
                deferred = Some(OverrideReq {
                    mount: fb.clone(),
                    dest: source.mount.clone(),
                    codec: fmt.codec(),
                });
            }
        }
    } else {
        hub.hooks.auth.stream_start(&source.mount);
    }

    info!("Source {} initialised", source.mount);
    inner.flags &= !SOURCE_ON_DEMAND;
    deferred
}

/// Steal the listeners of `req.mount` for the newly started `req.dest`.
/// Both mounts must carry the same codec. With no live source to steal
/// from, the request is forwarded to the file-serve module.
pub fn set_override(hub: &Arc<Hub>, req: &OverrideReq) {
    let config = hub.config();
    let found = hub.registry.find_with_fallback(&config, &req.mount);
    match found {
        Some(source) if source.mount != req.dest => {
            let mut moved = false;
            {
                let mut inner = source.inner.lock();
                let codec = inner.format.as_ref().map(|f| f.codec());
                if codec == Some(req.codec) {
                    if inner.listener_count > 0 && inner.fallback.mount.is_none() {
                        inner.fallback = FallbackInfo {
                            mount: Some(req.dest.clone()),
                            limit: 0,
                            codec: Some(req.codec),
                        };
                        inner.termination_count = inner.listener_count;
                        inner.timer_start_ms = hub.now_ms();
                        inner.flags |= SOURCE_LISTENERS_SYNC;
                        wakeup_listeners(hub, &source.mount, &inner);
                        moved = true;
                    }
                } else {
                    error!(
                        "{} and {} are different formats, not overriding",
                        source.mount, req.dest
                    );
                }
            }
            if moved {
                info!("moving from {} to {}", req.mount, req.dest);
            }
        }
        Some(_) => {}
        None => {
            hub.hooks.fserve.set_override(&req.mount, &req.dest, req.codec);
        }
    }
}

/// Install the bitrate-hinted fallback descriptor ahead of a shutdown.
pub fn set_fallback(hub: &Arc<Hub>, mount: &str, inner: &mut SourceInner, dest_mount: Option<&str>) {
    let Some(dest) = dest_mount else {
        info!("No fallback on {mount}");
        return;
    };
    if inner.listener_count == 0 {
        info!("fallback on {mount} to {dest}, but no listeners");
        return;
    }
    let connected = hub.now_sec().saturating_sub(inner.producer_con_time);
    let mut bitrate = 0;
    if connected > 40 {
        bitrate = inner.in_rate.avg();
    }
    if bitrate == 0 && inner.limit_rate > 0 {
        bitrate = inner.limit_rate / 8;
    }
    inner.fallback = FallbackInfo {
        mount: Some(dest.to_string()),
        limit: bitrate,
        codec: inner.format.as_ref().map(|f| f.codec()),
    };
    info!(
        "fallback set on {mount} to {dest}({bitrate}) with {} listeners",
        inner.listener_count
    );
}

/// Begin winding the source down: flag the sync step, wake everyone,
/// emit final stats, run the disconnect hooks, and install the
/// configured fallback so listeners have somewhere to go.
pub fn source_shutdown(
    hub: &Arc<Hub>,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    with_fallback: bool,
    now_ms: u64,
) {
    info!("Source \"{}\" exiting", source.mount);
    inner.flags &= !(SOURCE_ON_DEMAND | SOURCE_TIMEOUT);
    inner.termination_count = inner.listener_count;
    inner.timer_start_ms = now_ms;
    inner.flags |= SOURCE_TERMINATING | SOURCE_LISTENERS_SYNC;
    wakeup_listeners(hub, &source.mount, inner);

    let config = hub.config();
    let mcfg = config.find_mount(&source.mount);
    if inner.producer_con_time > 0 {
        // only when the source actually ran
        update_source_stats(hub, &source.mount, inner, hub.now_sec());
        if let Some(m) = mcfg {
            if let Some(script) = &m.on_disconnect {
                crate::hooks::run_script(script, &source.mount);
            }
        }
        hub.hooks.auth.stream_end(&source.mount);
    }
    if with_fallback && hub.is_running() {
        let dest = mcfg.and_then(|m| m.fallback_mount.clone());
        set_fallback(hub, &source.mount, inner, dest.as_deref());
    }
}

/// Source has fully drained: drop the reservation, or hold it for
/// `wait_time` so a reconnecting producer keeps the name.
pub fn terminate_tick(hub: &Arc<Hub>, worker: &Arc<WorkerHandle>, client: &mut Client) -> Disposition {
    let Some(source) = client.source.clone() else {
        return Disposition::Release;
    };
    client.schedule_ms = worker.time_ms() + 100;
    if client.connection.discon_time != 0 {
        if client.connection.discon_time >= worker.time_sec() {
            return Disposition::Continue;
        }
    } else {
        let mut reserved = false;
        {
            let mut inner = source.inner.lock();
            if inner.listener_count > 0 {
                info!("remaining listeners to process is {}", inner.listener_count);
            }
            if inner.wait_time > 0 {
                client.connection.discon_time = worker.time_sec() + inner.wait_time;
                info!(
                    "keeping {} reserved for {} seconds",
                    source.mount, inner.wait_time
                );
                reserved = true;
            }
        }
        hub.dec_sources();
        let sources = hub.source_count();
        hub.stats.update_global(|g| g.sources = sources);
        if reserved {
            return Disposition::Continue;
        }
    }
    source_client_release(hub, client, &source)
}

fn source_client_release(hub: &Arc<Hub>, client: &mut Client, source: &Arc<Source>) -> Disposition {
    hub.reduce_global_sampling();
    {
        let mut inner = source.inner.lock();
        inner.flags &= !(SOURCE_RUNNING | SOURCE_ON_DEMAND);
        client.clear_flag(CLIENT_AUTHENTICATED);
        if let Some(fmt) = &inner.format {
            client.connection.sent_bytes = fmt.read_bytes();
        }
    }
    free_source(hub, source);
    Disposition::Release
}

/// Unlink from the registry and drop everything the source holds.
pub fn free_source(hub: &Arc<Hub>, source: &Arc<Source>) {
    info!("source {} to be freed", source.mount);
    hub.registry.remove(&source.mount);
    let mut inner = source.inner.lock();
    if inner.listener_count > 0 {
        warn!(
            "active listeners on mountpoint {} ({}, {})",
            source.mount, inner.listener_count, inner.termination_count
        );
    }
    if inner.dump_file.take().is_some() {
        info!("Closing dumpfile for {}", source.mount);
    }
    inner.intro_file = None;
    inner.dump_filename = None;
    inner.queue.clear();
    inner.audio_info.clear();
    inner.producer = None;
    inner.format = None;
    hub.hooks.yp.remove(&source.mount);
    hub.stats.remove_mount(&source.mount);
    info!("freeing source \"{}\"", source.mount);
}

/// Replace the producer of a running mount. The old client is reaped by
/// its own worker; listeners restart their position accounting so the
/// burst logic re-applies against the new stream.
pub fn swap_producer(hub: &Arc<Hub>, source: &Arc<Source>, inner: &mut SourceInner, incoming: &mut Client) {
    info!(
        "source {} hijacked by another client, terminating old one",
        source.mount
    );
    let read_bytes = inner
        .format
        .as_mut()
        .map(|f| f.take_read_bytes())
        .unwrap_or(0);
    let old = inner.producer.replace(ProducerRef {
        signal: incoming.signal.clone(),
        id: incoming.connection.id,
    });
    if let Some(old) = old {
        old.signal
            .deposed_read_bytes
            .store(read_bytes, Ordering::Release);
        old.signal.deposed.store(true, Ordering::Release);
        old.signal.wake.store(true, Ordering::Release);
        if let Some(w) = hub.pool.get(old.signal.worker.load(Ordering::Acquire)) {
            w.wakeup();
        }
    }
    inner.producer_queue_pos = 0;
    inner.producer_con_time = incoming.connection.con_time.max(1);
    for entry in inner.listeners.values() {
        entry.signal.reset_pos.store(true, Ordering::Release);
    }
    wakeup_listeners(hub, &source.mount, inner);
    if let Some(fmt) = inner.format.as_mut() {
        fmt.swap_producer(incoming);
    }
}

/// Fold the interval's counters into the published stats and refresh
/// the listener send budget from the measured ingest rate.
pub fn update_source_stats(hub: &Arc<Hub>, mount: &str, inner: &mut SourceInner, now_sec: u64) {
    let incoming_rate = inner.in_rate.avg();
    let kbytes_sent = inner.bytes_sent_since_update / 1024;
    let kbytes_read = inner.bytes_read_since_update / 1024;
    inner.total_bytes_sent += kbytes_sent * 1024;

    let outgoing_kbitrate = 8 * inner.out_rate.avg() / 1024;
    let total_bytes_read = inner.format.as_ref().map(|f| f.read_bytes()).unwrap_or(0);
    let total_bytes_sent = inner.total_bytes_sent;
    let queue_size = inner.queue.size;
    let connected = if inner.producer_con_time > 0 {
        now_sec.saturating_sub(inner.producer_con_time)
    } else {
        0
    };
    hub.stats.update_mount(mount, |m| {
        m.outgoing_kbitrate = outgoing_kbitrate;
        m.incoming_bitrate = 8 * incoming_rate;
        m.total_bytes_read = total_bytes_read;
        m.total_bytes_sent = total_bytes_sent;
        m.total_mbytes_sent = total_bytes_sent / (1024 * 1024);
        m.queue_size = queue_size;
        m.connected = connected;
    });
    hub.stats.update_global(|g| {
        g.stream_kbytes_sent += kbytes_sent;
        g.stream_kbytes_read += kbytes_read;
    });

    inner.bytes_sent_since_update %= 1024;
    inner.bytes_read_since_update %= 1024;
    inner.incoming_rate = incoming_rate;
    inner.listener_send_trigger = incoming_rate;
}

/// Pick `ice-*` (and bitrate) keys out of the producer's
/// `ice-audio-info` header, url-unescaped, for the stats page.
pub fn parse_audio_info(hub: &Arc<Hub>, mount: &str, inner: &mut SourceInner, header: &str) {
    for part in header.split(';') {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if !(name.starts_with("ice-") || name == "bitrate") {
            continue;
        }
        if let Some(unescaped) = util::url_unescape(value.trim()) {
            inner.audio_info.insert(name.to_string(), unescaped.clone());
            let key = name.to_string();
            hub.stats
                .update_mount(mount, |m| {
                    m.audio_info.insert(key, unescaped);
                });
        }
    }
}

/// Resolve settings for a source: global limits first, then the mount's
/// own options, then whatever the producer's headers offer for the
/// presentation fields.
pub fn apply_mount_settings(
    hub: &Arc<Hub>,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    parser: Option<&RequestInfo>,
) {
    let config = hub.config();
    let mount = &source.mount;
    info!("Applying mount information for \"{mount}\"");

    inner.queue.size_limit = config.limits.queue_size_limit;
    inner.queue.min_size = config.limits.min_queue_size;
    inner.queue.default_burst_size = config.limits.burst_size;
    inner.timeout_secs = config.limits.source_timeout;

    let listenurl = format!(
        "http://{}:{}{}",
        config.server.hostname, config.server.port, mount
    );

    let mcfg = config.find_mount(mount);
    if let (Some(m), Some(fmt)) = (mcfg, inner.format.as_mut()) {
        fmt.apply_settings(m);
    }

    let header = |names: &[&str]| -> Option<String> {
        let p = parser?;
        names.iter().find_map(|n| p.header(n).map(str::to_string))
    };

    // public flag: mount option wins, else producer headers
    let public = match mcfg.map(|m| m.yp_public) {
        Some(v) if v >= 0 => v > 0,
        _ => header(&["ice-public", "icy-pub", "x-audiocast-public", "icy-public"])
            .map(|v| v.trim() == "1")
            .unwrap_or(inner.yp_public),
    };
    if inner.yp_public != public {
        debug!("YP changed to {public}");
        if public {
            hub.hooks.yp.add(mount);
        } else {
            hub.hooks.yp.remove(mount);
        }
        inner.yp_public = public;
    }

    inner.details.name = mcfg
        .and_then(|m| m.stream_name.clone())
        .or_else(|| header(&["ice-name", "icy-name", "x-audiocast-name"]))
        .or_else(|| Some("Unspecified name".to_string()));
    inner.details.description = mcfg
        .and_then(|m| m.stream_description.clone())
        .or_else(|| header(&["ice-description", "icy-description", "x-audiocast-description"]));
    inner.details.url = mcfg
        .and_then(|m| m.stream_url.clone())
        .or_else(|| header(&["ice-url", "icy-url", "x-audiocast-url"]));
    inner.details.genre = mcfg
        .and_then(|m| m.stream_genre.clone())
        .or_else(|| header(&["ice-genre", "icy-genre", "x-audiocast-genre"]))
        .or_else(|| Some("various".to_string()));
    inner.details.bitrate = mcfg
        .and_then(|m| m.bitrate.clone())
        .or_else(|| header(&["ice-bitrate", "icy-br", "x-audiocast-bitrate"]));
    inner.details.contenttype = mcfg
        .and_then(|m| m.content_type.clone())
        .or_else(|| inner.format.as_ref().map(|f| f.contenttype().to_string()))
        .unwrap_or_else(|| "application/octet-stream".to_string());

    inner.limit_rate = mcfg.map(|m| m.limit_rate).unwrap_or(0);

    inner.dump_filename = mcfg
        .and_then(|m| m.dumpfile.as_deref())
        .map(util::strftime_now);

    inner.intro_file = None;
    if let Some(name) = mcfg.and_then(|m| m.intro_filename.as_deref()) {
        let path = std::path::Path::new(&config.server.webroot_dir).join(name);
        debug!("intro file is {name}");
        match File::open(&path) {
            Ok(f) => inner.intro_file = Some(f),
            Err(e) => warn!("Cannot open intro file \"{}\": {e}", path.display()),
        }
    }

    if let Some(m) = mcfg {
        if m.queue_size_limit > 0 {
            inner.queue.size_limit = m.queue_size_limit;
        }
        if m.source_timeout > 0 {
            inner.timeout_secs = m.source_timeout;
        }
        if m.burst_size >= 0 {
            inner.queue.default_burst_size = m.burst_size as u64;
        }
        if m.min_queue_size > 0 {
            inner.queue.min_size = m.min_queue_size;
        }
        inner.wait_time = m.wait_time;
        inner.on_connect = m.on_connect.clone();
        inner.on_disconnect = m.on_disconnect.clone();
    }
    if inner.queue.min_size < inner.queue.default_burst_size {
        inner.queue.min_size = inner.queue.default_burst_size;
    }
    if inner.queue.min_size + 40_000 > inner.queue.size_limit {
        inner.queue.size_limit = inner.queue.min_size + 40_000;
    }

    let details = inner.details.clone();
    let hidden = mcfg.map(|m| m.hidden).unwrap_or(false);
    let max_listeners = mcfg.map(|m| m.max_listeners);
    let subtype = mcfg.and_then(|m| m.subtype.clone());
    let public = inner.yp_public;
    hub.stats.update_mount(mount, |m| {
        m.listenurl = Some(listenurl);
        m.server_name = details.name.clone();
        m.server_description = details.description.clone();
        m.server_url = details.url.clone();
        m.genre = details.genre.clone();
        m.bitrate = details.bitrate.clone();
        m.server_type = Some(details.contenttype.clone());
        m.subtype = subtype;
        m.public = public;
        m.hidden = hidden;
        m.max_listeners = max_listeners;
    });
    debug!(
        "queue size {} min queue {} burst {} timeout {}",
        inner.queue.size_limit, inner.queue.min_size, inner.queue.default_burst_size, inner.timeout_secs
    );
}

/// Producer attach: claim (or hijack) the mount and queue the HTTP
/// handshake. On any rejection the client is handed back for the 403.
pub fn source_startup(
    hub: &Arc<Hub>,
    mut client: Box<Client>,
    uri: &str,
    format: Option<Box<dyn FormatAdapter>>,
    shoutcast_compat: bool,
) -> Result<(), (Box<Client>, crate::errors::StartupError)> {
    use crate::errors::StartupErrorValue;

    let Some(source) = hub.registry.reserve(uri, client.has_flag(CLIENT_HIJACKER)) else {
        warn!("Mountpoint {uri} in use");
        return Err((client, StartupErrorValue::MountInUse.into()));
    };

    let hijacked = {
        let mut inner = source.inner.lock();
        if client.has_flag(CLIENT_HIJACKER) && source_running(&inner) {
            swap_producer(hub, &source, &mut inner, &mut client);
            true
        } else {
            false
        }
    };

    if !hijacked {
        if !hub.try_add_source() {
            warn!("Request to add source when maximum source limit reached");
            free_source(hub, &source);
            return Err((client, StartupErrorValue::SourceLimit.into()));
        }
        let sources = hub.source_count();
        info!("sources count is now {sources}");
        hub.stats.update_global(|g| g.sources = sources);

        let Some(fmt) = format else {
            hub.dec_sources();
            free_source(hub, &source);
            return Err((client, StartupErrorValue::UnsupportedContent.into()));
        };
        let mut inner = source.inner.lock();
        inner.format = Some(fmt);
        inner.producer = Some(ProducerRef {
            signal: client.signal.clone(),
            id: client.connection.id,
        });
        apply_mount_settings(hub, &source, &mut inner, Some(&client.parser));
    }

    client.respcode = 200;
    client.source = Some(source.clone());

    if shoutcast_compat {
        source.inner.lock().flags |= SOURCE_SHOUTCAST_COMPAT;
        // no handshake to send; the http-send tick falls straight
        // through to the stream callback
        client.set_queue(None);
        client.intro_offset = 0;
        client.ops = ClientOps::SourceHttpSend;
    } else {
        let ok = RefBlock::new(Bytes::from_static(b"HTTP/1.0 200 OK\r\n\r\n"), 0);
        // body bytes read in with the request must not be lost
        if let Some(prev) = client.refbuf.take() {
            ok.set_next(prev);
        }
        client.intro_offset = client.pos as i64;
        client.pos = 0;
        client.refbuf = Some(ok);
        client.ops = ClientOps::SourceHttpSend;
    }
    client.set_flag(crate::client::CLIENT_ACTIVE);
    client.schedule_ms = 0;
    match hub.pool.attach(client) {
        Ok(()) => Ok(()),
        Err(client) => {
            error!("no worker available for source {uri}");
            hub.dec_sources();
            free_source(hub, &source);
            Err((client, StartupErrorValue::NoWorkers.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryIo, MemoryIoHandle};
    use crate::config::{Config, MountConfig};
    use crate::format::RawAdapter;
    use crate::hub::Hub;

    fn test_worker(at_ms: u64) -> Arc<WorkerHandle> {
        let w = WorkerHandle::detached(0);
        w.set_time(at_ms);
        w
    }

    fn producer_setup(hub: &Arc<Hub>, worker: &Arc<WorkerHandle>) -> (Arc<Source>, Box<Client>, MemoryIoHandle) {
        let (io, handle) = MemoryIo::pair();
        let mut client = hub.new_client("9.9.9.9", Box::new(io));
        let source = hub.registry.reserve("/live", false).unwrap();
        {
            let mut inner = source.inner.lock();
            inner.format = Some(Box::new(
                RawAdapter::new(CodecType::Mp3, "audio/mpeg").with_chunk_size(1000),
            ));
            inner.producer = Some(ProducerRef {
                signal: client.signal.clone(),
                id: client.connection.id,
            });
            inner.queue.min_size = 4000;
            inner.queue.default_burst_size = 2000;
            inner.queue.size_limit = 50_000;
            inner.timeout_secs = 10;
        }
        client.source = Some(source.clone());
        client.ops = ClientOps::SourceRead;
        {
            let mut inner = source.inner.lock();
            source_init(hub, &source, &mut inner, &mut client, worker);
        }
        (source, client, handle)
    }

    fn fake_listener(source: &Arc<Source>, id: u64) -> Arc<ClientSignal> {
        let signal = Arc::new(ClientSignal::default());
        let mut inner = source.inner.lock();
        inner.listeners.insert(
            id,
            ListenerEntry {
                signal: signal.clone(),
                username: None,
            },
        );
        inner.listener_count += 1;
        signal
    }

    #[tokio::test]
    async fn producer_appends_and_keeps_queue_consistent() {
        let hub = Hub::new(Config::default());
        let worker = test_worker(5_000);
        let (source, mut client, handle) = producer_setup(&hub, &worker);
        for _ in 0..3 {
            handle.push_read(vec![3u8; 1000]);
        }
        assert!(matches!(
            producer_tick(&hub, &worker, &mut client),
            Disposition::Continue
        ));
        {
            let inner = source.inner.lock();
            // two pulls per tick
            assert_eq!(inner.producer_queue_pos, 2000);
            assert_eq!(inner.queue.size, inner.queue.chain_bytes());
            assert!(source_running(&inner));
        }
        assert_eq!(client.schedule_ms, 5_000 + 15);
        assert!(matches!(
            producer_tick(&hub, &worker, &mut client),
            Disposition::Continue
        ));
        let inner = source.inner.lock();
        assert_eq!(inner.producer_queue_pos, 3000);
        assert_eq!(inner.queue.size, inner.queue.chain_bytes());
    }

    #[tokio::test]
    async fn quiet_producer_backs_off_then_times_out() {
        let hub = Hub::new(Config::default());
        let worker = test_worker(5_000);
        let (source, mut client, _handle) = producer_setup(&hub, &worker);
        let backoff_before = source.inner.lock().skip_duration_ms;
        producer_tick(&hub, &worker, &mut client);
        let backoff_after = source.inner.lock().skip_duration_ms;
        assert!(backoff_after > backoff_before);
        assert!(source_running(&source.inner.lock()));

        // stay quiet past the source timeout
        worker.set_time(17_000);
        producer_tick(&hub, &worker, &mut client);
        let inner = source.inner.lock();
        assert!(!source_running(&inner));
        assert!(inner.flags & SOURCE_TIMEOUT != 0);
    }

    #[tokio::test]
    async fn dead_socket_stops_the_source() {
        let hub = Hub::new(Config::default());
        let worker = test_worker(5_000);
        let (source, mut client, handle) = producer_setup(&hub, &worker);
        handle.break_pipe();
        producer_tick(&hub, &worker, &mut client);
        assert!(!source_running(&source.inner.lock()));
    }

    #[tokio::test]
    async fn terminating_source_with_no_listeners_frees_the_mount() {
        let hub = Hub::new(Config::default());
        assert!(hub.try_add_source());
        let worker = test_worker(5_000);
        let (source, mut client, handle) = producer_setup(&hub, &worker);
        handle.break_pipe();
        producer_tick(&hub, &worker, &mut client); // RUNNING drops
        producer_tick(&hub, &worker, &mut client); // shutdown, no listeners
        assert_eq!(client.ops, ClientOps::SourceTerminate);
        assert!(matches!(
            terminate_tick(&hub, &worker, &mut client),
            Disposition::Release
        ));
        assert!(hub.registry.find_raw("/live").is_none());
        assert_eq!(hub.source_count(), 0);
        drop(source);
    }

    #[tokio::test]
    async fn shutdown_flags_sync_and_installs_fallback() {
        let mut config = Config::default();
        config.mounts.push(MountConfig {
            fallback_mount: Some("/backup".into()),
            ..MountConfig::named("/live")
        });
        let hub = Hub::new(config);
        let worker = test_worker(50_000);
        let (source, mut client, handle) = producer_setup(&hub, &worker);
        let listener_signal = fake_listener(&source, 42);
        handle.break_pipe();
        producer_tick(&hub, &worker, &mut client); // RUNNING drops
        producer_tick(&hub, &worker, &mut client); // shutdown with listeners
        let inner = source.inner.lock();
        assert!(inner.flags & SOURCE_TERMINATING != 0);
        assert!(inner.flags & SOURCE_LISTENERS_SYNC != 0);
        assert_eq!(inner.termination_count, 1);
        assert_eq!(inner.fallback.mount.as_deref(), Some("/backup"));
        assert!(listener_signal.wake.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn sync_that_never_drains_is_forced_out() {
        let hub = Hub::new(Config::default());
        let worker = test_worker(5_000);
        let (source, mut client, _handle) = producer_setup(&hub, &worker);
        {
            let mut inner = source.inner.lock();
            inner.flags |= SOURCE_LISTENERS_SYNC;
            inner.termination_count = 3;
            inner.timer_start_ms = 5_000;
        }
        producer_tick(&hub, &worker, &mut client);
        assert!(source_running(&source.inner.lock()));
        worker.set_time(7_000); // > 1500 ms later
        producer_tick(&hub, &worker, &mut client);
        let inner = source.inner.lock();
        assert!(!source_running(&inner));
        assert!(inner.flags & SOURCE_LISTENERS_SYNC == 0);
    }

    #[tokio::test]
    async fn hijack_swaps_producer_and_resets_positions() {
        let hub = Hub::new(Config::default());
        let worker = test_worker(5_000);
        let (source, mut old_client, handle) = producer_setup(&hub, &worker);
        handle.push_read(vec![1u8; 1000]);
        producer_tick(&hub, &worker, &mut old_client);
        let listener_signal = fake_listener(&source, 42);

        let (io2, _h2) = MemoryIo::pair();
        let mut new_client = hub.new_client("9.9.9.10", Box::new(io2));
        new_client.set_flag(CLIENT_HIJACKER);
        {
            let mut inner = source.inner.lock();
            swap_producer(&hub, &source, &mut inner, &mut new_client);
            assert_eq!(inner.producer_queue_pos, 0);
            assert_eq!(
                inner.producer.as_ref().unwrap().id,
                new_client.connection.id
            );
        }
        assert!(listener_signal.reset_pos.load(Ordering::Acquire));
        assert!(old_client.signal.deposed.load(Ordering::Acquire));
        // the deposed producer detaches on its next tick without
        // touching the source
        assert!(matches!(
            producer_tick(&hub, &worker, &mut old_client),
            Disposition::Release
        ));
        assert_eq!(old_client.connection.sent_bytes, 1000);
        assert!(source_running(&source.inner.lock()));
    }

    #[tokio::test]
    async fn audio_info_header_is_parsed_and_unescaped() {
        let hub = Hub::new(Config::default());
        let source = hub.registry.reserve("/live", false).unwrap();
        let mut inner = source.inner.lock();
        parse_audio_info(
            &hub,
            "/live",
            &mut inner,
            "ice-samplerate=44100;ice-channels=2;bitrate=128;junk=1;ice-genre=drum%20and%20bass",
        );
        assert_eq!(inner.audio_info.get("ice-samplerate").unwrap(), "44100");
        assert_eq!(inner.audio_info.get("bitrate").unwrap(), "128");
        assert_eq!(
            inner.audio_info.get("ice-genre").unwrap(),
            "drum and bass"
        );
        assert!(!inner.audio_info.contains_key("junk"));
        drop(inner);
        let stats = hub.stats.mount("/live").unwrap();
        assert_eq!(stats.audio_info.get("ice-channels").unwrap(), "2");
    }

    #[tokio::test]
    async fn mount_settings_clamp_queue_limits() {
        let mut config = Config::default();
        config.mounts.push(MountConfig {
            burst_size: 64_000,
            min_queue_size: 10_000,
            queue_size_limit: 20_000,
            ..MountConfig::named("/live")
        });
        let hub = Hub::new(config);
        let source = hub.registry.reserve("/live", false).unwrap();
        {
            let mut inner = source.inner.lock();
            inner.format = Some(Box::new(RawAdapter::new(CodecType::Mp3, "audio/mpeg")));
            apply_mount_settings(&hub, &source, &mut inner, None);
            assert_eq!(inner.queue.default_burst_size, 64_000);
            // burst may not exceed the retained window
            assert_eq!(inner.queue.min_size, 64_000);
            // and the queue must hold the window plus headroom
            assert_eq!(inner.queue.size_limit, 104_000);
        }
        let stats = hub.stats.mount("/live").unwrap();
        assert_eq!(stats.server_name.as_deref(), Some("Unspecified name"));
        assert_eq!(stats.genre.as_deref(), Some("various"));
        assert!(stats.listenurl.as_deref().unwrap().ends_with("/live"));
    }

    #[tokio::test]
    async fn stream_metadata_resolves_from_producer_headers() {
        let hub = Hub::new(Config::default());
        let source = hub.registry.reserve("/live", false).unwrap();
        let parser = RequestInfo::new()
            .with_header("ice-name", "Night Station")
            .with_header("icy-genre", "ambient")
            .with_header("icy-br", "192");
        let mut inner = source.inner.lock();
        inner.format = Some(Box::new(RawAdapter::new(CodecType::Mp3, "audio/mpeg")));
        apply_mount_settings(&hub, &source, &mut inner, Some(&parser));
        assert_eq!(inner.details.name.as_deref(), Some("Night Station"));
        assert_eq!(inner.details.genre.as_deref(), Some("ambient"));
        assert_eq!(inner.details.bitrate.as_deref(), Some("192"));
        assert_eq!(inner.details.contenttype, "audio/mpeg");
    }

    #[tokio::test]
    async fn wait_time_holds_the_reservation() {
        let hub = Hub::new(Config::default());
        assert!(hub.try_add_source());
        let worker = test_worker(100_000);
        let (source, mut client, _handle) = producer_setup(&hub, &worker);
        source.inner.lock().wait_time = 5;
        client.ops = ClientOps::SourceTerminate;
        assert!(matches!(
            terminate_tick(&hub, &worker, &mut client),
            Disposition::Continue
        ));
        assert_eq!(client.connection.discon_time, 105);
        assert!(hub.registry.find_raw("/live").is_some());
        // reservation expired
        worker.set_time(106_000);
        assert!(matches!(
            terminate_tick(&hub, &worker, &mut client),
            Disposition::Release
        ));
        assert!(hub.registry.find_raw("/live").is_none());
    }

    #[tokio::test]
    async fn rate_limited_producer_backs_off_without_reading() {
        let hub = Hub::new(Config::default());
        let worker = test_worker(60_000);
        let (source, mut client, handle) = producer_setup(&hub, &worker);
        {
            let mut inner = source.inner.lock();
            inner.limit_rate = 8; // absurdly low cap in bits/sec
            for i in 0..=5u64 {
                inner.in_rate.add(10_000, 50_000 + i * 1000);
            }
        }
        handle.push_read(vec![1u8; 1000]);
        producer_tick(&hub, &worker, &mut client);
        let inner = source.inner.lock();
        assert_eq!(inner.producer_queue_pos, 0);
        assert_eq!(client.schedule_ms, 60_000 + 110);
        drop(inner);
    }

    #[tokio::test]
    async fn stats_interval_publishes_counters() {
        let hub = Hub::new(Config::default());
        let worker = test_worker(5_000);
        let (source, _client, _handle) = producer_setup(&hub, &worker);
        {
            let mut inner = source.inner.lock();
            inner.bytes_sent_since_update = 10_500;
            inner.bytes_read_since_update = 2_200;
            for i in 0..=5u64 {
                let step = 1000 + i * 1000;
                inner.in_rate.add(16_000, step);
            }
            update_source_stats(&hub, "/live", &mut inner, 30);
            // remainders carry forward
            assert_eq!(inner.bytes_sent_since_update, 10_500 % 1024);
            assert_eq!(inner.listener_send_trigger, inner.incoming_rate);
            assert!(inner.incoming_rate > 0);
        }
        let stats = hub.stats.mount("/live").unwrap();
        assert!(stats.incoming_bitrate > 0);
        assert_eq!(stats.total_bytes_sent, 10_240);
    }
}
