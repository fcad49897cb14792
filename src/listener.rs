use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::block::{BLOCK_ON_QUEUE, BLOCK_RELEASED, BLOCK_SYNC};
use crate::client::{
    CheckBuffer, Client, ClientOps, CLIENT_HAS_INTRO_CONTENT, CLIENT_HAS_MOVED, CLIENT_IN_FSERVE,
    CLIENT_IS_SLAVE,
};
use crate::config::MountConfig;
use crate::errors::{AdmissionError, AdmissionErrorValue};
use crate::format::generic_write_to_client;
use crate::hub::Hub;
use crate::registry::MAX_FALLBACK_DEPTH;
use crate::source::{
    source_available, source_running, FallbackInfo, ListenerEntry, Source, SourceInner,
    SOURCE_LISTENERS_SYNC, SOURCE_ON_DEMAND, SOURCE_PAUSE_LISTENERS, SOURCE_RUNNING,
    SOURCE_TERMINATING,
};
use crate::util;
use crate::worker::{self, Disposition, WorkerHandle};

/// What a listener send pass decided.
enum SendResult {
    Ok,
    Release,
    Move(Arc<WorkerHandle>),
    /// Listener was detached for a fallback move; run it without the
    /// source lock.
    Fallback(FallbackInfo),
}

/// Where an admitted listener ended up.
pub enum AttachOutcome {
    Attached(Arc<Source>),
    FileServed,
}

/// Listener tick entry.
pub fn listener_tick(hub: &Arc<Hub>, worker: &Arc<WorkerHandle>, client: &mut Client) -> Disposition {
    client.fold_signals();
    let Some(source) = client.source.clone() else {
        return Disposition::Release;
    };
    let fallback = {
        let mut inner = source.inner.lock();
        match send_listener(hub, worker, &source, &mut inner, client) {
            SendResult::Ok => return Disposition::Continue,
            SendResult::Release => {
                listener_release(hub, &source.mount, &mut inner, client);
                return Disposition::Release;
            }
            SendResult::Move(target) => return Disposition::Move(target),
            SendResult::Fallback(fb) => fb,
        }
    };
    // detached from the dying source, lock released; try its fallback
    if move_listener(hub, client, &fallback) {
        client.schedule_ms = worker.time_ms();
        return Disposition::Continue;
    }
    // nowhere to go: rejoin and ride the termination out
    let mut inner = source.inner.lock();
    setup_listener(hub, &source, &mut inner, client);
    match waiting_tail(hub, worker, &mut inner, client) {
        SendResult::Ok => Disposition::Continue,
        _ => {
            listener_release(hub, &source.mount, &mut inner, client);
            Disposition::Release
        }
    }
}

/// Parked listener: on-demand source not yet (re)started.
pub fn pause_tick(_hub: &Arc<Hub>, worker: &Arc<WorkerHandle>, client: &mut Client) -> Disposition {
    client.fold_signals();
    let Some(source) = client.source.clone() else {
        return Disposition::Release;
    };
    let now_sec = worker.time_sec();
    let now_ms = worker.time_ms();
    let inner = source.inner.lock();
    if now_sec.saturating_sub(client.timer_start) > 15 {
        info!("Dropping listener, stuck in {} too long", source.mount);
        client.connection.error = true;
    }
    if source_running(&inner)
        || client.connection.error
        || inner.flags & SOURCE_PAUSE_LISTENERS == 0
        || inner.flags & (SOURCE_TERMINATING | SOURCE_LISTENERS_SYNC) != 0
    {
        client.ops = ClientOps::Listener;
        client.schedule_ms = now_ms;
        return Disposition::Continue;
    }
    client.schedule_ms = now_ms
        + if inner.flags & SOURCE_LISTENERS_SYNC != 0 {
            100
        } else {
            300
        };
    Disposition::Continue
}

/// Listener that already acknowledged the sync step, waiting for the
/// stragglers.
pub fn wait_tick(_hub: &Arc<Hub>, worker: &Arc<WorkerHandle>, client: &mut Client) -> Disposition {
    client.fold_signals();
    let Some(source) = client.source.clone() else {
        return Disposition::Release;
    };
    {
        let inner = source.inner.lock();
        if inner.flags & (SOURCE_TERMINATING | SOURCE_LISTENERS_SYNC) == SOURCE_LISTENERS_SYNC {
            client.schedule_ms = worker.time_ms() + 150;
            return Disposition::Continue;
        }
    }
    client.ops = ClientOps::Listener;
    client.schedule_ms = worker.time_ms();
    Disposition::Continue
}

fn send_listener(
    hub: &Arc<Hub>,
    worker: &Arc<WorkerHandle>,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    client: &mut Client,
) -> SendResult {
    let now_ms = worker.time_ms();
    let now_sec = worker.time_sec();

    if inner.flags & SOURCE_LISTENERS_SYNC != 0 {
        return listener_waiting_on_source(hub, worker, inner, client);
    }
    if client.connection.error {
        return SendResult::Release;
    }
    if client.connection.discon_time != 0 && now_sec >= client.connection.discon_time {
        info!("time limit reached for client #{}", client.connection.id);
        return SendResult::Release;
    }
    if !source_running(inner) {
        debug!("source not running, listener will wait");
        client.schedule_ms = now_ms + 100;
        return SendResult::Ok;
    }

    // once per stats interval, consider migrating towards the source
    if inner.client_stats_update > 0 && now_sec + 1 == inner.client_stats_update {
        if let Some(producer) = &inner.producer {
            let source_worker = producer.signal.worker.load(Ordering::Acquire);
            if let Some(target) =
                worker::listener_change_worker(hub, worker, source_worker, inner.listener_count)
            {
                return SendResult::Move(target);
            }
        }
    }

    let lag = inner.producer_queue_pos.saturating_sub(client.queue_pos);
    let mut limiter = inner.listener_send_trigger;
    if inner.incoming_rate > 0 && lag < inner.incoming_rate {
        limiter = inner.incoming_rate / 2;
    }
    let mut loops = 12;

    // progressive slowdown nearing the server bandwidth cap
    if hub.config().limits.max_bandwidth > 0 {
        let throttle = hub.throttle_level();
        if throttle > 2 {
            client.schedule_ms = now_ms + 30;
            return SendResult::Ok;
        }
        if throttle > 1 {
            loops = 2;
            client.schedule_ms = now_ms + 50;
        }
        if throttle > 0 && lag > inner.incoming_rate * 2 {
            client.schedule_ms = now_ms + 150;
        }
    }

    let mut total: u64 = 0;
    let mut result = SendResult::Ok;
    loop {
        if client.connection.error {
            result = SendResult::Release;
            break;
        }
        if loops == 0 || total > limiter {
            client.schedule_ms = now_ms + 15;
            break;
        }
        let bytes = run_check_buffer(hub, source, inner, client, now_ms);
        if bytes < 0 {
            break;
        }
        total += bytes as u64;
        loops -= 1;
    }
    inner.out_rate.add(total, now_ms);
    hub.global_rate_add(total, now_ms);
    inner.bytes_sent_since_update += total;

    // trimmed off the queue tail while still holding the block
    if let Some(rb) = &client.refbuf {
        if rb.has_flag(BLOCK_RELEASED) {
            info!(
                "Client {} ({}) has fallen too far behind on {}, removing",
                client.connection.id, client.connection.ip, source.mount
            );
            hub.stats
                .update_mount(&source.mount, |m| m.slow_listeners += 1);
            client.set_queue(None);
            result = SendResult::Release;
        }
    }
    result
}

/// Acknowledge one step of a coordinated transition: follow the
/// fallback if one is installed, else pause or drop.
fn listener_waiting_on_source(
    hub: &Arc<Hub>,
    worker: &Arc<WorkerHandle>,
    inner: &mut SourceInner,
    client: &mut Client,
) -> SendResult {
    inner.termination_count = inner.termination_count.saturating_sub(1);
    if client.connection.error {
        return SendResult::Release;
    }
    if inner.fallback.mount.is_some() {
        let fb = inner.fallback.clone();
        listener_detach(inner, client);
        return SendResult::Fallback(fb);
    }
    waiting_tail(hub, worker, inner, client)
}

fn waiting_tail(
    hub: &Arc<Hub>,
    worker: &Arc<WorkerHandle>,
    inner: &mut SourceInner,
    client: &mut Client,
) -> SendResult {
    let now_ms = worker.time_ms();
    if inner.flags & SOURCE_TERMINATING != 0 {
        if inner.flags & SOURCE_PAUSE_LISTENERS != 0 && hub.is_running() {
            if let Some(rb) = &client.refbuf {
                if rb.has_flag(BLOCK_ON_QUEUE) {
                    client.set_queue(None);
                }
            }
            client.ops = ClientOps::ListenerPause;
            client.set_flag(CLIENT_HAS_MOVED);
            client.schedule_ms = now_ms + 60;
            client.timer_start = worker.time_sec();
            return SendResult::Ok;
        }
        return SendResult::Release;
    }
    // wait for the remaining listeners to pass through this step
    client.ops = ClientOps::ListenerWait;
    client.schedule_ms = now_ms + 100;
    SendResult::Ok
}

fn run_check_buffer(
    hub: &Arc<Hub>,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    client: &mut Client,
    now_ms: u64,
) -> i64 {
    match client.check_buffer {
        CheckBuffer::HttpHeaders => http_source_listener(hub, &source.mount, inner, client, now_ms),
        CheckBuffer::Intro => http_source_intro(inner, client, now_ms),
        CheckBuffer::IntroFile => http_source_introfile(inner, client, now_ms),
        CheckBuffer::QueueAdvance => source_queue_advance(inner, client, now_ms),
        CheckBuffer::Write => match inner.format.as_mut() {
            Some(f) => f.write_to_client(client),
            None => generic_write_to_client(client),
        },
    }
}

/// Initial state: build and push the HTTP response, then hand over to
/// the intro stage.
fn http_source_listener(
    hub: &Arc<Hub>,
    mount: &str,
    inner: &mut SourceInner,
    client: &mut Client,
    now_ms: u64,
) -> i64 {
    if client.respcode > 0 && client.refbuf.is_none() {
        // response went out earlier (moved listener)
        client.check_buffer = CheckBuffer::Intro;
        return http_source_intro(inner, client, now_ms);
    }
    if inner.queue.size == 0 {
        // postpone until there is data on the queue
        client.schedule_ms = now_ms + 500;
        return -1;
    }
    if client.respcode == 0 {
        if !source_running(inner) {
            client.schedule_ms = now_ms + 200;
            return -1;
        }
        let SourceInner {
            format, details, ..
        } = &mut *inner;
        let built = match format.as_mut() {
            Some(f) => f.create_client_data(details, client).is_ok(),
            None => {
                crate::format::general_headers(details, client);
                true
            }
        };
        if !built {
            warn!("internal problem, dropping client {}", client.connection.id);
            client.connection.error = true;
            return -1;
        }
        hub.stats.update_mount(mount, |m| m.listener_connections += 1);
    }
    let ret = generic_write_to_client(client);
    if let Some(rb) = client.refbuf.clone() {
        if client.pos >= rb.len() {
            client.check_buffer = CheckBuffer::Intro;
            client.intro_offset = 0;
            if client.has_flag(CLIENT_HAS_INTRO_CONTENT) {
                client.refbuf = rb.take_next();
                client.pos = 0;
                if client.refbuf.is_none() {
                    client.clear_flag(CLIENT_HAS_INTRO_CONTENT);
                }
            } else {
                client.set_queue(None);
            }
            client.connection.sent_bytes = 0;
            return ret;
        }
    }
    client.schedule_ms = now_ms + 200;
    ret
}

fn http_source_intro(inner: &mut SourceInner, client: &mut Client, now_ms: u64) -> i64 {
    // the intro is only for listeners that have heard nothing yet
    if client.connection.sent_bytes > 0 {
        client.set_queue(None);
        client.check_buffer = CheckBuffer::QueueAdvance;
        return source_queue_advance(inner, client, now_ms);
    }
    client.intro_offset = 0;
    client.check_buffer = CheckBuffer::IntroFile;
    http_source_introfile(inner, client, now_ms)
}

fn http_source_introfile(inner: &mut SourceInner, client: &mut Client, now_ms: u64) -> i64 {
    let at_eof = match inner.intro_file.as_mut() {
        Some(f) => crate::format::file_read(client, f) < 0,
        None => true,
    };
    if at_eof {
        if inner.queue.tail_block().is_some() {
            client.set_queue(None);
            client.check_buffer = CheckBuffer::QueueAdvance;
            return source_queue_advance(inner, client, now_ms);
        }
        client.schedule_ms = now_ms + 100;
        client.intro_offset = 0; // replay the intro while waiting for data
        return -1;
    }
    match inner.format.as_mut() {
        Some(f) => f.write_to_client(client),
        None => generic_write_to_client(client),
    }
}

fn source_queue_advance(inner: &mut SourceInner, client: &mut Client, now_ms: u64) -> i64 {
    if client.refbuf.is_none() && locate_start_on_queue(inner, client, now_ms) < 0 {
        return -1;
    }
    let Some(rb) = client.refbuf.clone() else {
        return -1;
    };
    if client.pos >= rb.len() {
        match rb.next() {
            Some(next) => client.set_queue(Some(next)),
            None => {
                // caught up; run just after the producer's next read
                client.schedule_ms = inner.producer_sched_ms + 5;
                return -1;
            }
        }
    }
    match inner.format.as_mut() {
        Some(f) => f.write_to_client(client),
        None => generic_write_to_client(client),
    }
}

/// Choose the sync-aligned block a joining listener starts from,
/// honouring the requested burst size against the retained window.
fn locate_start_on_queue(inner: &mut SourceInner, client: &mut Client, now_ms: u64) -> i64 {
    if client.connection.error {
        return -1;
    }
    let Some(tail) = inner.queue.tail_block() else {
        return -1;
    };
    let mut refbuf;
    let mut lag: i64;
    if client.connection.sent_bytes > inner.queue.min_offset && tail.has_flag(BLOCK_SYNC) {
        // mid-stream rejoin: take the live edge
        lag = tail.len() as i64;
        refbuf = Some(tail);
    } else {
        let mut burst: i64 = client
            .parser
            .query_param("burst")
            .and_then(|v| v.parse().ok())
            .or_else(|| {
                client
                    .parser
                    .header("initial-burst")
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(inner.queue.default_burst_size as i64);
        burst -= client.connection.sent_bytes as i64;
        let mut size = inner.queue.min_size as i64;
        refbuf = inner.queue.min_cursor();
        lag = inner.queue.min_offset as i64;
        while size > burst {
            let Some(block) = refbuf.clone() else { break };
            let Some(next) = block.next() else { break };
            size -= block.len() as i64;
            lag -= block.len() as i64;
            refbuf = Some(next);
        }
        if lag < 0 {
            tracing::error!("negative lag locating start on {}", inner.details.mount);
            lag = 0;
        }
    }
    while let Some(block) = refbuf {
        if block.has_flag(BLOCK_SYNC) {
            client.set_queue(Some(block));
            client.intro_offset = -1;
            client.queue_pos = inner.producer_queue_pos.saturating_sub(lag.max(0) as u64);
            return 0;
        }
        lag -= block.len() as i64;
        refbuf = block.next();
    }
    client.schedule_ms = now_ms + 150;
    -1
}

/// Put a client onto a source's listener set in the right state. Caller
/// holds the source lock.
pub fn setup_listener(hub: &Arc<Hub>, source: &Arc<Source>, inner: &mut SourceInner, client: &mut Client) {
    client.ops = if inner.flags & SOURCE_LISTENERS_SYNC != 0 {
        ClientOps::ListenerWait
    } else if inner.flags & (SOURCE_RUNNING | SOURCE_ON_DEMAND) == SOURCE_ON_DEMAND {
        ClientOps::ListenerPause
    } else {
        ClientOps::Listener
    };
    client.source = Some(source.clone());
    client.queue_pos = 0;
    client.clear_flag(CLIENT_IN_FSERVE);
    client.timer_start = hub.now_sec();
    client.check_buffer = CheckBuffer::HttpHeaders;
    inner.listeners.insert(
        client.connection.id,
        ListenerEntry {
            signal: client.signal.clone(),
            username: client.username.clone(),
        },
    );
    inner.listener_count += 1;
    if inner.flags & (SOURCE_ON_DEMAND | SOURCE_RUNNING) == SOURCE_ON_DEMAND {
        if let Some(producer) = &inner.producer {
            producer.signal.wake.store(true, Ordering::Release);
            if let Some(w) = hub.pool.get(producer.signal.worker.load(Ordering::Acquire)) {
                w.wakeup();
            }
            debug!("woke up source for {}", source.mount);
        }
        client.schedule_ms = hub.now_ms() + 300;
    }
}

/// Take a listener off the source. A partially written shared block is
/// copied so the pending write can still finish.
pub fn listener_detach(inner: &mut SourceInner, client: &mut Client) {
    if client.check_buffer != CheckBuffer::HttpHeaders {
        if let Some(rb) = client.refbuf.clone() {
            if client.pos < rb.len() && rb.has_flag(BLOCK_ON_QUEUE) {
                client.refbuf = Some(rb.private_copy());
                client.set_flag(CLIENT_HAS_INTRO_CONTENT);
            }
        }
        client.check_buffer = CheckBuffer::Write;
        if !client.has_flag(CLIENT_HAS_INTRO_CONTENT) {
            client.set_queue(None);
        }
    }
    inner.listeners.remove(&client.connection.id);
    inner.listener_count = inner.listener_count.saturating_sub(1);
}

/// Detach plus the bookkeeping a leaving listener owes the server.
pub fn listener_release(hub: &Arc<Hub>, mount: &str, inner: &mut SourceInner, client: &mut Client) {
    listener_detach(inner, client);
    client.source = None;
    if inner.listener_count == 0 {
        inner.out_rate.reduce(1000);
    }
    hub.stats
        .update_global(|g| g.listeners = g.listeners.saturating_sub(1));
    hub.reduce_global_sampling();
    info!(
        "listener {} ({}) left {mount} after {} bytes",
        client.connection.id, client.connection.ip, client.connection.sent_bytes
    );
    hub.hooks.auth.release_listener(mount, &client.connection);
}

/// Move a listener to a fallback target: a live mount carrying the same
/// codec, else whatever file the fserve module has for it.
pub fn move_listener(hub: &Arc<Hub>, client: &mut Client, fb: &FallbackInfo) -> bool {
    if let Some(mount) = &fb.mount {
        if let Some(source) = hub.registry.find_raw(mount) {
            let mut inner = source.inner.lock();
            let codec_ok = match (fb.codec, inner.format.as_ref()) {
                (Some(c), Some(f)) => f.codec() == c,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if source_available(&inner) && codec_ok {
                setup_listener(hub, &source, &mut inner, client);
                return true;
            }
        }
    }
    if hub.hooks.fserve.serve(fb, client) {
        client.set_flag(CLIENT_IN_FSERVE);
        client.ops = ClientOps::Fserve;
        return true;
    }
    false
}

fn check_duplicate_logins(inner: &SourceInner, client: &Client, mcfg: &MountConfig) -> bool {
    if mcfg.allow_duplicate_users {
        return true;
    }
    let Some(username) = client.username.as_deref() else {
        return true;
    };
    if client.has_flag(CLIENT_IS_SLAVE) {
        return true;
    }
    for entry in inner.listeners.values() {
        if entry.username.as_deref() == Some(username) {
            if mcfg.drop_existing_listener {
                info!(
                    "Found {username} on {}, dropping previous account",
                    mcfg.mount
                );
                entry.signal.error.store(true, Ordering::Release);
                return true;
            }
            return false;
        }
    }
    true
}

/// Admit a listener to `requested`, walking fallbacks and enforcing
/// server and mount limits. On success the client is attached to a
/// source (or handed to the file server) but not yet scheduled.
pub fn add_listener(
    hub: &Arc<Hub>,
    requested: &str,
    client: &mut Client,
) -> Result<AttachOutcome, AdmissionError> {
    let config = hub.config();
    let mountinfo = config.find_mount(requested).cloned();
    let mut mount = requested.to_string();
    let mut minfo = mountinfo.clone();
    let mut hops = MAX_FALLBACK_DEPTH;

    'walk: loop {
        // locate a live source, following dead mounts' fallbacks
        let source = loop {
            if hops == 0 {
                warn!("preventing a fallback loop on {requested}");
                return Err(AdmissionErrorValue::FallbackLoop.into());
            }
            if let Some(s) = hub.registry.find_raw(&mount) {
                if source_available(&s.inner.lock()) {
                    break s;
                }
            }
            match minfo.as_ref().and_then(|m| m.fallback_mount.clone()) {
                Some(next) => {
                    mount = next;
                    minfo = config.find_mount(&mount).cloned();
                    hops -= 1;
                }
                None => {
                    // no live source anywhere; a rate hint may let the
                    // file server take it
                    let rate = minfo
                        .as_ref()
                        .map(|m| m.limit_rate / 8)
                        .filter(|r| *r > 0)
                        .or_else(|| util::rate_hint_from_mount(&mount));
                    if let Some(rate) = rate {
                        let fb = FallbackInfo {
                            mount: Some(mount.clone()),
                            limit: rate,
                            codec: None,
                        };
                        if hub.hooks.fserve.serve(&fb, client) {
                            client.set_flag(CLIENT_IN_FSERVE);
                            client.ops = ClientOps::Fserve;
                            hub.stats.update_global(|g| {
                                g.listeners += 1;
                                g.listener_connections += 1;
                            });
                            return Ok(AttachOutcome::FileServed);
                        }
                    }
                    return Err(AdmissionErrorValue::NotFound.into());
                }
            }
        };

        let mut inner = source.inner.lock();
        if !source_available(&inner) {
            // lost a race with a shutdown; walk again
            hops -= 1;
            continue 'walk;
        }

        if client.has_flag(CLIENT_IS_SLAVE) {
            info!("client is from a slave, bypassing limits");
        } else {
            let stream_bitrate = 8 * inner.in_rate.avg();
            if config.limits.max_bandwidth > 0 {
                let global_rate = 8 * hub.global_rate_avg();
                debug!("server outgoing bitrate is {global_rate}");
                if global_rate + stream_bitrate > config.limits.max_bandwidth {
                    info!("server-wide outgoing bandwidth limit reached");
                    return Err(AdmissionErrorValue::ServerBandwidth {
                        redirect: requested.to_string(),
                    }
                    .into());
                }
            }
            if let Some(mi) = &mountinfo {
                if !check_duplicate_logins(&inner, client, mi) {
                    return Err(AdmissionErrorValue::DuplicateLogin.into());
                }
                if mi.max_listener_duration > 0 && client.connection.discon_time == 0 {
                    client.connection.discon_time = hub.now_sec() + mi.max_listener_duration;
                }
                let mut within_limits = true;
                if mi.max_bandwidth > -1 && stream_bitrate > 0 {
                    debug!(
                        "checking bandwidth limits for {} ({stream_bitrate}, {})",
                        mi.mount, mi.max_bandwidth
                    );
                    if (inner.listener_count + 1) * stream_bitrate > mi.max_bandwidth as u64 {
                        info!("bandwidth limit reached on {}", source.mount);
                        within_limits = false;
                    }
                }
                if within_limits
                    && mi.max_listeners >= 0
                    && inner.listener_count >= mi.max_listeners as u64
                {
                    info!("max listener count reached on {}", source.mount);
                    within_limits = false;
                }
                if !within_limits {
                    let full_fallback = minfo
                        .as_ref()
                        .filter(|m| m.fallback_when_full)
                        .and_then(|m| m.fallback_mount.clone());
                    if let Some(next) = full_fallback {
                        drop(inner);
                        info!("stream full trying {next}");
                        mount = next;
                        minfo = config.find_mount(&mount).cloned();
                        hops -= 1;
                        continue 'walk;
                    }
                    return Err(AdmissionErrorValue::MountFull {
                        redirect: requested.to_string(),
                    }
                    .into());
                }
            }
        }

        client.connection.sent_bytes = 0;
        client.set_queue(None);
        setup_listener(hub, &source, &mut inner, client);
        drop(inner);
        hub.stats.update_global(|g| {
            g.listeners += 1;
            g.listener_connections += 1;
        });
        hub.reduce_global_sampling();
        return Ok(AttachOutcome::Attached(source));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientSignal, MemoryIo, MemoryIoHandle, RequestInfo};
    use crate::config::Config;
    use crate::format::{CodecType, RawAdapter};
    use crate::source::ProducerRef;
    use bytes::Bytes;
    use crate::block::RefBlock;

    fn test_hub(config: Config) -> Arc<Hub> {
        Hub::new(config)
    }

    fn live_source(hub: &Arc<Hub>, mount: &str, min: u64, burst: u64, limit: u64) -> Arc<Source> {
        let source = hub.registry.reserve(mount, false).unwrap();
        let mut inner = source.inner.lock();
        inner.format = Some(Box::new(RawAdapter::new(CodecType::Mp3, "audio/mpeg")));
        inner.producer = Some(ProducerRef {
            signal: Arc::new(ClientSignal::default()),
            id: 9000,
        });
        inner.flags |= SOURCE_RUNNING;
        inner.queue.min_size = min;
        inner.queue.default_burst_size = burst;
        inner.queue.size_limit = limit;
        inner.details.contenttype = "audio/mpeg".to_string();
        inner.client_stats_update = u64::MAX; // keep migration checks out of the way
        drop(inner);
        source
    }

    fn feed(source: &Arc<Source>, blocks: usize, block_len: usize) {
        let mut inner = source.inner.lock();
        for _ in 0..blocks {
            let b = RefBlock::new(Bytes::from(vec![7u8; block_len]), BLOCK_SYNC);
            inner.queue.append(b).unwrap();
            inner.producer_queue_pos += block_len as u64;
        }
        inner.queue.trim();
    }

    fn test_client(hub: &Arc<Hub>) -> (Box<Client>, MemoryIoHandle) {
        let (io, handle) = MemoryIo::pair();
        (hub.new_client("10.1.1.1", Box::new(io)), handle)
    }

    fn bytes_behind_tail(client: &Client) -> u64 {
        // from the listener's block (inclusive) through the tail
        let mut total = 0;
        let mut p = client.refbuf.clone();
        while let Some(b) = p {
            total += b.len() as u64;
            p = b.next();
        }
        total
    }

    #[tokio::test]
    async fn burst_starts_a_pre_roll_behind_the_tail() {
        let hub = test_hub(Config::default());
        let source = live_source(&hub, "/live", 65_536, 16_384, 500_000);
        feed(&source, 50, 4096); // 200 KB of sync-tagged blocks
        let (mut client, _h) = test_client(&hub);
        let mut inner = source.inner.lock();
        assert_eq!(locate_start_on_queue(&mut inner, &mut client, 0), 0);
        drop(inner);
        let behind = bytes_behind_tail(&client);
        assert!(
            (16_384..=16_384 + 4096).contains(&behind),
            "burst distance {behind}"
        );
        assert!(client.refbuf.as_ref().unwrap().has_flag(BLOCK_SYNC));
        // the listener's timeline position reflects the pre-roll
        let inner = source.inner.lock();
        assert_eq!(inner.producer_queue_pos - client.queue_pos, behind);
    }

    #[tokio::test]
    async fn burst_query_param_beats_header() {
        let hub = test_hub(Config::default());
        let source = live_source(&hub, "/live", 65_536, 16_384, 500_000);
        feed(&source, 50, 4096);
        let (mut client, _h) = test_client(&hub);
        client.parser = RequestInfo::new()
            .with_header("initial-burst", "40960")
            .with_query("burst", "8192");
        let mut inner = source.inner.lock();
        assert_eq!(locate_start_on_queue(&mut inner, &mut client, 0), 0);
        drop(inner);
        let behind = bytes_behind_tail(&client);
        assert!(
            (8_192..=8_192 + 4096).contains(&behind),
            "burst distance {behind}"
        );
    }

    #[tokio::test]
    async fn no_sync_block_reachable_defers() {
        let hub = test_hub(Config::default());
        let source = live_source(&hub, "/live", 8_000, 4_000, 500_000);
        {
            let mut inner = source.inner.lock();
            for _ in 0..4 {
                inner
                    .queue
                    .append(RefBlock::new(Bytes::from(vec![1u8; 1000]), 0))
                    .unwrap();
            }
        }
        let (mut client, _h) = test_client(&hub);
        let mut inner = source.inner.lock();
        assert_eq!(locate_start_on_queue(&mut inner, &mut client, 1000), -1);
        assert!(client.refbuf.is_none());
        assert_eq!(client.schedule_ms, 1150);
    }

    #[tokio::test]
    async fn headers_flow_into_queue_data() {
        let hub = test_hub(Config::default());
        let source = live_source(&hub, "/live", 16_000, 4_000, 500_000);
        feed(&source, 10, 1000);
        let (mut client, handle) = test_client(&hub);
        let worker = WorkerHandle::detached(0);
        worker.set_time(5_000);
        {
            let mut inner = source.inner.lock();
            setup_listener(&hub, &source, &mut inner, &mut client);
        }
        assert_eq!(client.ops, ClientOps::Listener);
        // first tick: response headers plus the burst
        assert!(matches!(
            listener_tick(&hub, &worker, &mut client),
            Disposition::Continue
        ));
        let written = handle.written();
        let text = String::from_utf8_lossy(&written);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Type: audio/mpeg"));
        // stream bytes follow the blank line
        let header_end = text.find("\r\n\r\n").unwrap() + 4;
        assert!(written.len() > header_end);
        assert!(written[header_end..].iter().all(|b| *b == 7));
        assert_eq!(
            hub.stats.mount("/live").unwrap().listener_connections,
            1
        );
    }

    #[tokio::test]
    async fn slow_listener_is_dropped_with_stat() {
        let hub = test_hub(Config::default());
        let source = live_source(&hub, "/live", 4_000, 2_000, 500_000);
        feed(&source, 10, 1000);
        let (mut client, _h) = test_client(&hub);
        let worker = WorkerHandle::detached(0);
        worker.set_time(5_000);
        let held = {
            let mut inner = source.inner.lock();
            setup_listener(&hub, &source, &mut inner, &mut client);
            inner.queue.head().unwrap()
        };
        // the listener is mid-block when the queue overruns and the head
        // is trimmed out from under it
        client.check_buffer = CheckBuffer::QueueAdvance;
        client.respcode = 200;
        client.set_queue(Some(held.clone()));
        {
            let mut inner = source.inner.lock();
            inner.queue.size_limit = 1;
            inner.queue.trim();
        }
        assert!(held.has_flag(BLOCK_RELEASED));
        assert!(matches!(
            listener_tick(&hub, &worker, &mut client),
            Disposition::Release
        ));
        assert_eq!(hub.stats.mount("/live").unwrap().slow_listeners, 1);
        assert_eq!(source.inner.lock().listener_count, 0);
        assert!(client.source.is_none());
    }

    #[tokio::test]
    async fn sync_fallback_moves_listener_between_mounts() {
        let hub = test_hub(Config::default());
        let dying = live_source(&hub, "/live", 16_000, 4_000, 500_000);
        let backup = live_source(&hub, "/backup", 16_000, 4_000, 500_000);
        feed(&backup, 10, 1000);
        let (mut client, _h) = test_client(&hub);
        let worker = WorkerHandle::detached(0);
        worker.set_time(5_000);
        {
            let mut inner = dying.inner.lock();
            setup_listener(&hub, &dying, &mut inner, &mut client);
            inner.flags |= SOURCE_LISTENERS_SYNC;
            inner.termination_count = 1;
            inner.fallback = FallbackInfo {
                mount: Some("/backup".to_string()),
                limit: 0,
                codec: Some(CodecType::Mp3),
            };
        }
        assert!(matches!(
            listener_tick(&hub, &worker, &mut client),
            Disposition::Continue
        ));
        assert_eq!(dying.inner.lock().listener_count, 0);
        assert_eq!(dying.inner.lock().termination_count, 0);
        assert_eq!(backup.inner.lock().listener_count, 1);
        assert!(Arc::ptr_eq(client.source.as_ref().unwrap(), &backup));
    }

    #[tokio::test]
    async fn terminating_without_fallback_releases() {
        let hub = test_hub(Config::default());
        let source = live_source(&hub, "/live", 16_000, 4_000, 500_000);
        let (mut client, _h) = test_client(&hub);
        let worker = WorkerHandle::detached(0);
        worker.set_time(5_000);
        {
            let mut inner = source.inner.lock();
            setup_listener(&hub, &source, &mut inner, &mut client);
            inner.flags |= SOURCE_TERMINATING | SOURCE_LISTENERS_SYNC;
            inner.termination_count = 1;
        }
        assert!(matches!(
            listener_tick(&hub, &worker, &mut client),
            Disposition::Release
        ));
        assert_eq!(source.inner.lock().listener_count, 0);
    }

    #[tokio::test]
    async fn duplicate_login_policy() {
        let hub = test_hub(Config::default());
        let source = live_source(&hub, "/live", 16_000, 4_000, 500_000);
        let bob_signal = Arc::new(ClientSignal::default());
        source.inner.lock().listeners.insert(
            77,
            ListenerEntry {
                signal: bob_signal.clone(),
                username: Some("bob".to_string()),
            },
        );
        let (mut client, _h) = test_client(&hub);
        client.username = Some("bob".to_string());
        let mut mcfg = MountConfig::named("/live");
        mcfg.allow_duplicate_users = false;
        let inner = source.inner.lock();
        assert!(!check_duplicate_logins(&inner, &client, &mcfg));
        mcfg.drop_existing_listener = true;
        assert!(check_duplicate_logins(&inner, &client, &mcfg));
        assert!(bob_signal.error.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn admission_not_found_and_loop_guard() {
        let mut config = Config::default();
        config.mounts.push(MountConfig {
            fallback_mount: Some("/b".into()),
            ..MountConfig::named("/a")
        });
        config.mounts.push(MountConfig {
            fallback_mount: Some("/a".into()),
            ..MountConfig::named("/b")
        });
        let hub = test_hub(config);
        let (mut client, _h) = test_client(&hub);
        match add_listener(&hub, "/nowhere", &mut client) {
            Err(e) => assert!(matches!(e.value, AdmissionErrorValue::NotFound)),
            Ok(_) => panic!("admitted to a mount that does not exist"),
        }
        match add_listener(&hub, "/a", &mut client) {
            Err(e) => assert!(matches!(e.value, AdmissionErrorValue::FallbackLoop)),
            Ok(_) => panic!("fallback loop not detected"),
        }
    }

    #[tokio::test]
    async fn admission_full_mount_redirects_to_requested() {
        let mut config = Config::default();
        config.mounts.push(MountConfig {
            max_listeners: 0,
            ..MountConfig::named("/live")
        });
        let hub = test_hub(config);
        live_source(&hub, "/live", 16_000, 4_000, 500_000);
        let (mut client, _h) = test_client(&hub);
        match add_listener(&hub, "/live", &mut client) {
            Err(e) => match e.value {
                AdmissionErrorValue::MountFull { redirect } => assert_eq!(redirect, "/live"),
                other => panic!("unexpected rejection {other:?}"),
            },
            Ok(_) => panic!("admitted past max_listeners"),
        }
    }

    #[tokio::test]
    async fn admission_full_mount_follows_fallback_when_full() {
        let mut config = Config::default();
        config.mounts.push(MountConfig {
            max_listeners: 0,
            fallback_when_full: true,
            fallback_mount: Some("/spill".into()),
            ..MountConfig::named("/live")
        });
        let hub = test_hub(config);
        live_source(&hub, "/live", 16_000, 4_000, 500_000);
        let spill = live_source(&hub, "/spill", 16_000, 4_000, 500_000);
        let (mut client, _h) = test_client(&hub);
        match add_listener(&hub, "/live", &mut client) {
            Ok(AttachOutcome::Attached(s)) => assert!(Arc::ptr_eq(&s, &spill)),
            _ => panic!("expected spill attach"),
        }
        assert_eq!(spill.inner.lock().listener_count, 1);
    }

    #[tokio::test]
    async fn admission_rejects_over_server_bandwidth() {
        let mut config = Config::default();
        config.limits.max_bandwidth = 1_000_000;
        let hub = test_hub(config);
        live_source(&hub, "/live", 16_000, 4_000, 500_000);
        // existing traffic saturates the server cap
        for i in 0..=10u64 {
            hub.global_rate_add(130_000, i * 1000);
        }
        let (mut client, _h) = test_client(&hub);
        match add_listener(&hub, "/live", &mut client) {
            Err(e) => match e.value {
                AdmissionErrorValue::ServerBandwidth { redirect } => {
                    assert_eq!(redirect, "/live");
                }
                other => panic!("unexpected rejection {other:?}"),
            },
            Ok(_) => panic!("admitted past server bandwidth"),
        }
    }

    #[tokio::test]
    async fn on_demand_attach_parks_and_wakes_producer() {
        let hub = test_hub(Config::default());
        let source = live_source(&hub, "/live", 16_000, 4_000, 500_000);
        {
            let mut inner = source.inner.lock();
            inner.flags &= !SOURCE_RUNNING;
            inner.flags |= SOURCE_ON_DEMAND;
        }
        let (mut client, _h) = test_client(&hub);
        match add_listener(&hub, "/live", &mut client) {
            Ok(AttachOutcome::Attached(_)) => {}
            _ => panic!("expected attach"),
        }
        assert_eq!(client.ops, ClientOps::ListenerPause);
        let inner = source.inner.lock();
        let producer = inner.producer.as_ref().unwrap();
        assert!(producer.signal.wake.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn listener_count_matches_map() {
        let hub = test_hub(Config::default());
        let source = live_source(&hub, "/live", 16_000, 4_000, 500_000);
        let mut clients = Vec::new();
        for _ in 0..5 {
            let (mut c, h) = test_client(&hub);
            add_listener(&hub, "/live", &mut c).ok().unwrap();
            clients.push((c, h));
        }
        {
            let inner = source.inner.lock();
            assert_eq!(inner.listener_count as usize, inner.listeners.len());
            assert_eq!(inner.listener_count, 5);
        }
        let (mut gone, _h) = clients.pop().unwrap();
        let mut inner = source.inner.lock();
        listener_release(&hub, "/live", &mut inner, &mut gone);
        assert_eq!(inner.listener_count as usize, inner.listeners.len());
        assert_eq!(inner.listener_count, 4);
    }
}
