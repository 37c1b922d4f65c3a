//! The command dispatcher.
//!
//! Routes parsed commands through authentication, the reader-writer lock,
//! the AOF, and the fence pipeline. Mutations follow a strict order:
//! validate (preflight), append to the AOF, then commit the in-memory
//! change, all inside one write guard, so an AOF failure never leaves
//! memory ahead of disk and a successful reply implies the record reached
//! the log. Fence notices enter their channel before the guard drops, so
//! channel order is AOF order.
//!
//! Replay and follower apply run through the same `apply_mutation` path as
//! live writes, with the AOF append suppressed (replay reads the log;
//! followers persist the raw stream themselves).

use crate::config::{format_memory, parse_memory, FollowTarget};
use crate::error::{Result, ServerError};
use crate::records::snapshot_records;
use crate::render;
use crate::state::{AppState, Store};
use bytes::Bytes;
use chrono::Utc;
use meridian_core::{Geometry, SearchKind};
use meridian_fence::{DetectMask, FenceRegion, Hook, MutationNotice, Trigger};
use meridian_protocol::{
    encode_array, Command, Dialect, HookSpec, ProtocolError, RegionSpec, Reply, SetHookCmd,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a command stream originates. Sources differ in authentication,
/// read-only enforcement, AOF handling and fence dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Client { http: bool },
    /// Startup replay: AOF suppressed, fences suppressed.
    Replay,
    /// Follower apply: AOF written from the raw stream, fences active.
    Follower,
}

/// Per-connection command context.
#[derive(Debug)]
pub struct Session {
    pub dialect: Dialect,
    pub authenticated: bool,
    pub repl_offset: u64,
    pub source: Source,
}

impl Session {
    pub fn client(http: bool) -> Session {
        Session {
            dialect: if http { Dialect::Json } else { Dialect::Resp },
            authenticated: false,
            repl_offset: 0,
            source: Source::Client { http },
        }
    }

    pub fn internal(source: Source) -> Session {
        Session {
            dialect: Dialect::Resp,
            authenticated: true,
            repl_offset: 0,
            source,
        }
    }

    fn is_client(&self) -> bool {
        matches!(self.source, Source::Client { .. })
    }
}

/// What the connection loop does next.
pub enum Outcome {
    Reply(Reply),
    /// SYNC: switch the connection to raw AOF streaming from this offset.
    StartSync { offset: u64 },
}

pub fn dispatch(state: &Arc<AppState>, session: &mut Session, args: &[Bytes]) -> Result<Outcome> {
    let cmd = Command::parse(args)?;
    let desc = cmd.desc();
    state.total_commands.fetch_add(1, Ordering::Relaxed);

    if session.is_client() {
        if matches!(cmd, Command::ReplBase { .. }) {
            return Err(ProtocolError::UnknownCommand("replbase".into()).into());
        }
        if !desc.exempt_auth && !session.authenticated {
            let required = state.read_store().runtime.requirepass.is_some();
            if required {
                return Err(ServerError::AuthRequired);
            }
        }
    }

    if desc.mutation {
        return mutate(state, session, &cmd, args).map(Outcome::Reply);
    }
    command(state, session, cmd)
}

// ---------------------------------------------------------------------------
// Write path
// ---------------------------------------------------------------------------

pub(crate) struct NoticeSeed {
    key: String,
    id: String,
    prev: Option<Geometry>,
    cur: Option<Geometry>,
    fields: Vec<(String, f64)>,
}

pub(crate) struct Effect {
    reply: Reply,
    notice: Option<NoticeSeed>,
    hook_added: Option<Arc<Hook>>,
    hook_removed: Option<String>,
}

impl Effect {
    fn reply(reply: Reply) -> Effect {
        Effect {
            reply,
            notice: None,
            hook_added: None,
            hook_removed: None,
        }
    }
}

fn mutate(state: &Arc<AppState>, session: &Session, cmd: &Command, args: &[Bytes]) -> Result<Reply> {
    let now = Instant::now();
    let mut store = state.write_store();

    if session.is_client() && state.is_following() {
        return Err(ServerError::ReadOnly);
    }

    let will_append = preflight(&store, cmd, session)?;
    if will_append && session.is_client() {
        if let Some(aof) = store.aof.as_mut() {
            aof.append(&encode_array(args))?;
        }
    }

    let mut effect = apply_mutation(&mut store, cmd, now)?;
    // The notice goes on the fence channel while the write guard is still
    // held: channel order is AOF order, which per-hook FIFO relies on.
    if session.source != Source::Replay {
        if let Some(seed) = effect.notice.take() {
            let hooks = store.hooks.hooks_for(&seed.key);
            let _ = state.fence_tx.send(MutationNotice {
                key: seed.key,
                id: seed.id,
                prev: seed.prev,
                cur: seed.cur,
                fields: seed.fields,
                hooks,
                time: Utc::now(),
            });
        }
    }
    drop(store);

    if let Some(hook) = &effect.hook_added {
        state.hub.ensure_worker(hook);
    }
    if let Some(name) = &effect.hook_removed {
        state.hub.remove(name);
    }
    Ok(effect.reply)
}

/// Validation before anything is written: errors here abort the command
/// before the AOF sees it. The returned flag says whether the command has
/// an effect worth logging (no-op DELs and such are not appended).
fn preflight(store: &Store, cmd: &Command, session: &Session) -> Result<bool> {
    let now = Instant::now();
    match cmd {
        Command::Set(c) => {
            if session.is_client() {
                if let Some(maxmem) = store.runtime.maxmemory {
                    let delta = match store.catalog.get(&c.key) {
                        Some(col) => col.projected_set_delta(&c.id, &c.object, &c.fields),
                        None => (c.id.len() + c.object.weight() + 8 * c.fields.len()) as isize,
                    };
                    let total = store.catalog.total_weight() as isize;
                    if delta > 0 && total + delta > maxmem as isize {
                        return Err(ServerError::OutOfMemory);
                    }
                }
            }
            Ok(true)
        }
        Command::Fset { key, id, .. } => {
            let col = store.catalog.get(key).ok_or(ServerError::KeyNotFound)?;
            if col.get(id, now).is_none() {
                return Err(ServerError::IdNotFound);
            }
            Ok(true)
        }
        Command::Expire { key, id, .. } => {
            let col = store.catalog.get(key).ok_or(ServerError::KeyNotFound)?;
            if col.get(id, now).is_none() {
                return Err(ServerError::IdNotFound);
            }
            Ok(true)
        }
        Command::Del { key, id } => Ok(store
            .catalog
            .get(key)
            .and_then(|c| c.peek(id))
            .is_some()),
        Command::Persist { key, id } => Ok(store
            .catalog
            .get(key)
            .and_then(|c| c.get(id, now))
            .is_some()),
        Command::Drop { key } => Ok(store.catalog.get(key).is_some()),
        Command::SetHook(c) => {
            Hook::validate_endpoint(&c.endpoint)?;
            Ok(true)
        }
        Command::DelHook { name } => Ok(store.hooks.get(name).is_some()),
        // The REPLBASE record is only ever written by shrink itself.
        Command::ReplBase { .. } => Ok(false),
        _ => Ok(false),
    }
}

fn hook_from_cmd(c: &SetHookCmd) -> Hook {
    let (trigger, key, region) = match &c.spec {
        HookSpec::Nearby { key, region } => {
            (Trigger::Nearby, key.clone(), FenceRegion::Area(region.clone()))
        }
        HookSpec::Within { key, region } => {
            (Trigger::Within, key.clone(), FenceRegion::Area(region.clone()))
        }
        HookSpec::Intersects { key, region } => (
            Trigger::Intersects,
            key.clone(),
            FenceRegion::Area(region.clone()),
        ),
        HookSpec::Roam { key, pattern, meters } => (
            Trigger::Roam,
            key.clone(),
            FenceRegion::Roam {
                pattern: pattern.clone(),
                meters: *meters,
            },
        ),
    };
    Hook {
        name: c.name.clone(),
        endpoint: c.endpoint.clone(),
        key,
        trigger,
        region,
        detect: DetectMask::from_names(&c.detect),
        meta: c.meta.clone(),
    }
}

/// Commit one mutation against the store. Shared by live writes, startup
/// replay and follower apply.
pub(crate) fn apply_mutation(store: &mut Store, cmd: &Command, now: Instant) -> Result<Effect> {
    match cmd {
        Command::Set(c) => {
            let expires_at = c.ex.map(|s| now + Duration::from_secs_f64(s));
            let collection = store.catalog.get_or_create(&c.key);
            let prev = collection.set(&c.id, c.object.clone(), c.fields.clone(), expires_at);
            let existed = prev.is_some();
            let fields = collection
                .peek(&c.id)
                .map(|item| {
                    collection
                        .item_fields(item)
                        .into_iter()
                        .map(|(n, v)| (n.to_string(), v))
                        .collect()
                })
                .unwrap_or_default();
            Ok(Effect {
                reply: Reply::Integer(existed as i64),
                notice: Some(NoticeSeed {
                    key: c.key.clone(),
                    id: c.id.clone(),
                    prev: prev.and_then(|p| p.object.geometry().cloned()),
                    cur: c.object.geometry().cloned(),
                    fields,
                }),
                hook_added: None,
                hook_removed: None,
            })
        }
        Command::Del { key, id } => {
            let prev = store.catalog.get_mut(key).and_then(|c| c.del(id));
            store.catalog.drop_if_empty(key);
            let existed = prev.is_some();
            let notice = prev.map(|p| NoticeSeed {
                key: key.clone(),
                id: id.clone(),
                prev: p.object.geometry().cloned(),
                cur: None,
                fields: Vec::new(),
            });
            Ok(Effect {
                reply: Reply::Integer(existed as i64),
                notice,
                hook_added: None,
                hook_removed: None,
            })
        }
        Command::Fset { key, id, field, value } => {
            let collection = store.catalog.get_mut(key).ok_or(ServerError::KeyNotFound)?;
            let changed = collection
                .fset(id, field, *value, now)
                .ok_or(ServerError::IdNotFound)?;
            let geo = collection
                .peek(id)
                .and_then(|item| item.object.geometry().cloned());
            let fields = collection
                .peek(id)
                .map(|item| {
                    collection
                        .item_fields(item)
                        .into_iter()
                        .map(|(n, v)| (n.to_string(), v))
                        .collect()
                })
                .unwrap_or_default();
            Ok(Effect {
                reply: Reply::Integer(changed as i64),
                notice: Some(NoticeSeed {
                    key: key.clone(),
                    id: id.clone(),
                    prev: geo.clone(),
                    cur: geo,
                    fields,
                }),
                hook_added: None,
                hook_removed: None,
            })
        }
        Command::Expire { key, id, seconds } => {
            let applied = store
                .catalog
                .get_mut(key)
                .map(|c| c.expire(id, now + Duration::from_secs_f64(*seconds), now))
                .unwrap_or(false);
            Ok(Effect::reply(Reply::Integer(applied as i64)))
        }
        Command::Persist { key, id } => {
            let had = store
                .catalog
                .get_mut(key)
                .map(|c| c.persist(id, now))
                .unwrap_or(false);
            Ok(Effect::reply(Reply::Integer(had as i64)))
        }
        Command::Drop { key } => {
            let existed = store.catalog.drop_collection(key);
            Ok(Effect::reply(Reply::Integer(existed as i64)))
        }
        Command::SetHook(c) => {
            let hook = hook_from_cmd(c);
            let replaced = store.hooks.insert(hook);
            let added = store.hooks.get(&c.name).cloned();
            Ok(Effect {
                reply: Reply::Integer(replaced.is_none() as i64),
                notice: None,
                hook_added: added,
                hook_removed: None,
            })
        }
        Command::DelHook { name } => {
            let removed = store.hooks.remove(name);
            Ok(Effect {
                reply: Reply::Integer(removed.is_some() as i64),
                notice: None,
                hook_added: None,
                hook_removed: removed.map(|h| h.name.clone()),
            })
        }
        Command::ReplBase { .. } => Ok(Effect::reply(Reply::Simple("OK"))),
        other => Err(ProtocolError::UnknownCommand(other.desc().name.into()).into()),
    }
}

/// Apply one record from the leader's replication stream: persist the raw
/// bytes to the local AOF and commit it, with fences active. Called only
/// by the follower task, one record at a time, in stream order.
pub(crate) fn apply_replicated(state: &Arc<AppState>, raw: &[u8], args: &[Bytes]) -> Result<()> {
    let cmd = Command::parse(args)?;
    if !cmd.desc().mutation {
        return Ok(());
    }
    let now = Instant::now();
    let mut store = state.write_store();
    if let Some(aof) = store.aof.as_mut() {
        aof.append(raw)?;
    }
    let mut effect = apply_mutation(&mut store, &cmd, now)?;
    if let Some(seed) = effect.notice.take() {
        let hooks = store.hooks.hooks_for(&seed.key);
        let _ = state.fence_tx.send(MutationNotice {
            key: seed.key,
            id: seed.id,
            prev: seed.prev,
            cur: seed.cur,
            fields: seed.fields,
            hooks,
            time: Utc::now(),
        });
    }
    drop(store);

    if let Some(hook) = &effect.hook_added {
        state.hub.ensure_worker(hook);
    }
    if let Some(name) = &effect.hook_removed {
        state.hub.remove(name);
    }
    Ok(())
}

/// Reap one expired item through the full mutation pipeline, so the AOF,
/// fences and followers all observe a plain DEL.
pub fn synthesize_del(state: &Arc<AppState>, key: &str, id: &str) -> Result<()> {
    let now = Instant::now();
    let mut store = state.write_store();
    let expired = store
        .catalog
        .get(key)
        .is_some_and(|c| c.is_expired(id, now));
    if !expired {
        return Ok(());
    }
    if let Some(aof) = store.aof.as_mut() {
        aof.append(&encode_array(&[
            b"DEL".as_slice(),
            key.as_bytes(),
            id.as_bytes(),
        ]))?;
    }
    let prev = store.catalog.get_mut(key).and_then(|c| c.del(id));
    store.catalog.drop_if_empty(key);
    if let Some(prev) = prev {
        let hooks = store.hooks.hooks_for(key);
        let _ = state.fence_tx.send(MutationNotice {
            key: key.to_string(),
            id: id.to_string(),
            prev: prev.object.geometry().cloned(),
            cur: None,
            fields: Vec::new(),
            hooks,
            time: Utc::now(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Read + admin path
// ---------------------------------------------------------------------------

fn resolve_region(store: &Store, region: &RegionSpec, now: Instant) -> Result<Geometry> {
    match region {
        RegionSpec::Geometry(g) => Ok(g.clone()),
        RegionSpec::Ref { key, id } => {
            let col = store.catalog.get(key).ok_or(ServerError::KeyNotFound)?;
            let item = col.get(id, now).ok_or(ServerError::IdNotFound)?;
            item.object
                .geometry()
                .cloned()
                .ok_or(ServerError::Core(meridian_core::CoreError::NotAGeometry))
        }
    }
}

fn command(state: &Arc<AppState>, session: &mut Session, cmd: Command) -> Result<Outcome> {
    let now = Instant::now();
    let dialect = session.dialect;
    let reply = match cmd {
        Command::Ping => match dialect {
            Dialect::Resp => Reply::Simple("PONG"),
            Dialect::Json => Reply::Json(json!({ "ping": "pong" })),
        },
        Command::Output(None) => {
            let name = match dialect {
                Dialect::Resp => "resp",
                Dialect::Json => "json",
            };
            match dialect {
                Dialect::Resp => Reply::Bulk(name.into()),
                Dialect::Json => Reply::Json(json!({ "output": name })),
            }
        }
        Command::Output(Some(d)) => {
            session.dialect = d;
            Reply::Simple("OK")
        }
        Command::Auth { password } => {
            let expected = state.read_store().runtime.requirepass.clone();
            match expected {
                None => return Err(ServerError::NoPasswordSet),
                Some(p) if p == password => {
                    session.authenticated = true;
                    Reply::Simple("OK")
                }
                Some(_) => return Err(ServerError::InvalidPassword),
            }
        }
        Command::Get { key, id, format } => {
            let store = state.read_store();
            let item = store
                .catalog
                .get(&key)
                .and_then(|c| c.get(&id, now));
            match item {
                None => match dialect {
                    Dialect::Resp => Reply::Null,
                    Dialect::Json => Reply::Json(json!({ "object": serde_json::Value::Null })),
                },
                Some(item) => render::get_reply(dialect, item, format)?,
            }
        }
        Command::Bounds { key } => {
            let store = state.read_store();
            let col = store.catalog.get(&key).ok_or(ServerError::KeyNotFound)?;
            match col.bounds() {
                Some(bbox) => render::bounds_reply(dialect, &bbox),
                None => Reply::Null,
            }
        }
        Command::Keys { pattern } => {
            let store = state.read_store();
            let keys = store.catalog.keys(&pattern);
            match dialect {
                Dialect::Resp => {
                    Reply::Array(keys.into_iter().map(Reply::bulk).collect())
                }
                Dialect::Json => Reply::Json(json!({ "keys": keys })),
            }
        }
        Command::Stats { keys } => {
            let store = state.read_store();
            let stats: Vec<_> = keys
                .iter()
                .map(|k| store.catalog.get(k).map(|c| c.stats()))
                .collect();
            match dialect {
                Dialect::Resp => Reply::Array(
                    stats
                        .into_iter()
                        .map(|s| match s {
                            None => Reply::Null,
                            Some(s) => Reply::Array(vec![
                                Reply::bulk("in_memory_size"),
                                Reply::Integer(s.in_memory_size as i64),
                                Reply::bulk("num_objects"),
                                Reply::Integer(s.num_objects as i64),
                                Reply::bulk("num_points"),
                                Reply::Integer(s.num_points as i64),
                                Reply::bulk("num_strings"),
                                Reply::Integer(s.num_strings as i64),
                            ]),
                        })
                        .collect(),
                ),
                Dialect::Json => Reply::Json(json!({
                    "stats": stats
                        .into_iter()
                        .map(|s| match s {
                            None => serde_json::Value::Null,
                            Some(s) => json!({
                                "in_memory_size": s.in_memory_size,
                                "num_objects": s.num_objects,
                                "num_points": s.num_points,
                                "num_strings": s.num_strings,
                            }),
                        })
                        .collect::<Vec<_>>(),
                })),
            }
        }
        Command::Server => server_reply(state, dialect),
        Command::Ttl { key, id } => {
            let store = state.read_store();
            let ttl = store.catalog.get(&key).and_then(|c| c.ttl(&id, now));
            let seconds: i64 = match ttl {
                None => -2,
                Some(None) => -1,
                Some(Some(d)) => d.as_secs() as i64,
            };
            match dialect {
                Dialect::Resp => Reply::Integer(seconds),
                Dialect::Json => Reply::Json(json!({ "ttl": seconds })),
            }
        }
        Command::Scan(c) => {
            let store = state.read_store();
            let col = store.catalog.get(&c.key).ok_or(ServerError::KeyNotFound)?;
            let page = col.scan(now, &c.opts);
            render::page_reply(dialect, col, &page, c.output)
        }
        Command::Within(c) => {
            let store = state.read_store();
            let region = resolve_region(&store, &c.region, now)?;
            let col = store.catalog.get(&c.key).ok_or(ServerError::KeyNotFound)?;
            let page = col.search(&region, SearchKind::Within, now, &c.opts);
            render::page_reply(dialect, col, &page, c.output)
        }
        Command::Intersects(c) => {
            let store = state.read_store();
            let region = resolve_region(&store, &c.region, now)?;
            let col = store.catalog.get(&c.key).ok_or(ServerError::KeyNotFound)?;
            let page = col.search(&region, SearchKind::Intersects, now, &c.opts);
            render::page_reply(dialect, col, &page, c.output)
        }
        Command::Nearby(c) => {
            let store = state.read_store();
            let col = store.catalog.get(&c.key).ok_or(ServerError::KeyNotFound)?;
            let page = col.nearby(c.lon, c.lat, c.meters, now, &c.opts);
            render::page_reply(dialect, col, &page, c.output)
        }
        Command::Hooks { pattern } => {
            let store = state.read_store();
            let hooks = store.hooks.matching(&pattern);
            hooks_reply(state, dialect, &hooks)
        }
        Command::ConfigGet { param } => config_get(state, dialect, &param)?,
        Command::ConfigSet { param, value } => config_set(state, &param, &value)?,
        Command::Follow { target } => follow(state, target)?,
        Command::AofShrink => aof_shrink(state)?,
        Command::ReplConf { offset } => {
            session.repl_offset = offset;
            Reply::Simple("OK")
        }
        Command::Sync => {
            if matches!(session.source, Source::Client { http: true }) {
                return Err(ServerError::NotOverHttp);
            }
            return Ok(Outcome::StartSync {
                offset: session.repl_offset,
            });
        }
        other => {
            return Err(ProtocolError::UnknownCommand(other.desc().name.into()).into());
        }
    };
    Ok(Outcome::Reply(reply))
}

fn hooks_reply(state: &Arc<AppState>, dialect: Dialect, hooks: &[Arc<Hook>]) -> Reply {
    match dialect {
        Dialect::Resp => Reply::Array(
            hooks
                .iter()
                .map(|h| {
                    Reply::Array(vec![
                        Reply::bulk(&h.name),
                        Reply::bulk(&h.key),
                        Reply::bulk(&h.endpoint),
                        Reply::bulk(h.trigger.name()),
                        Reply::Integer(state.hub.pending(&h.name) as i64),
                    ])
                })
                .collect(),
        ),
        Dialect::Json => Reply::Json(json!({
            "hooks": hooks
                .iter()
                .map(|h| {
                    let pending = state.hub.pending(&h.name);
                    json!({
                        "name": h.name,
                        "key": h.key,
                        "endpoint": h.endpoint,
                        "trigger": h.trigger.name(),
                        "detect": h.detect.names(),
                        "meta": h.meta.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
                        "pending": pending,
                        "active": pending > 0,
                    })
                })
                .collect::<Vec<_>>(),
        })),
    }
}

fn server_reply(state: &Arc<AppState>, dialect: Dialect) -> Reply {
    let store = state.read_store();
    let mut num_objects = 0usize;
    let mut num_points = 0usize;
    let mut num_strings = 0usize;
    for (_, col) in store.catalog.iter() {
        let s = col.stats();
        num_objects += s.num_objects;
        num_points += s.num_points;
        num_strings += s.num_strings;
    }
    let aof_size = store.aof.as_ref().map(|a| a.logical_len()).unwrap_or(0);
    let body = json!({
        "id": state.server_id,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "num_collections": store.catalog.len(),
        "num_objects": num_objects,
        "num_points": num_points,
        "num_strings": num_strings,
        "num_hooks": store.hooks.len(),
        "in_memory_size": store.catalog.total_weight(),
        "aof_size": aof_size,
        "followers": state.followers.load(Ordering::Relaxed),
        "following": state
            .following()
            .map(|(h, p)| format!("{h}:{p}")),
        "caught_up": state.caught_up.load(Ordering::Relaxed),
        "caught_up_once": state.caught_up_once.load(Ordering::Relaxed),
        "total_commands": state.total_commands.load(Ordering::Relaxed),
    });
    match dialect {
        Dialect::Json => Reply::Json(json!({ "stats": body })),
        Dialect::Resp => {
            let map = body.as_object().cloned().unwrap_or_default();
            let mut elems = Vec::with_capacity(map.len() * 2);
            for (k, v) in map {
                elems.push(Reply::bulk(k));
                elems.push(match v {
                    serde_json::Value::Number(n) => Reply::bulk(n.to_string()),
                    serde_json::Value::Bool(b) => Reply::bulk(b.to_string()),
                    serde_json::Value::String(s) => Reply::bulk(s),
                    other => Reply::bulk(other.to_string()),
                });
            }
            Reply::Array(elems)
        }
    }
}

fn config_get(state: &Arc<AppState>, dialect: Dialect, param: &str) -> Result<Reply> {
    let store = state.read_store();
    let value = match param {
        "requirepass" => store.runtime.requirepass.clone().unwrap_or_default(),
        "maxmemory" => store
            .runtime
            .maxmemory
            .map(format_memory)
            .unwrap_or_else(|| "0".into()),
        "protected-mode" => {
            if store.runtime.protected() {
                "yes".into()
            } else {
                "no".into()
            }
        }
        other => return Err(ServerError::UnknownConfigParam(other.to_string())),
    };
    Ok(match dialect {
        Dialect::Resp => Reply::Array(vec![Reply::bulk(param), Reply::bulk(value)]),
        Dialect::Json => {
            let mut properties = serde_json::Map::new();
            properties.insert(param.to_string(), serde_json::Value::String(value));
            Reply::Json(json!({ "properties": properties }))
        }
    })
}

fn config_set(state: &Arc<AppState>, param: &str, value: &str) -> Result<Reply> {
    let mut store = state.write_store();
    match param {
        "requirepass" => {
            store.runtime.requirepass = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
        }
        "maxmemory" => {
            store.runtime.maxmemory = if value.is_empty() || value == "0" {
                None
            } else {
                Some(parse_memory(value)?)
            };
        }
        "protected-mode" => {
            store.runtime.protected_mode = Some(match value.to_ascii_lowercase().as_str() {
                "yes" => true,
                "no" => false,
                other => return Err(ServerError::InvalidConfigValue(other.to_string())),
            });
        }
        other => return Err(ServerError::UnknownConfigParam(other.to_string())),
    }
    store.runtime.save(&state.config.config_path())?;
    Ok(Reply::Simple("OK"))
}

fn follow(state: &Arc<AppState>, target: Option<(String, u16)>) -> Result<Reply> {
    {
        let mut store = state.write_store();
        store.runtime.follow = target.as_ref().map(|(host, port)| FollowTarget {
            host: host.clone(),
            port: *port,
        });
        store.runtime.save(&state.config.config_path())?;
    }
    state.caught_up.store(false, Ordering::Relaxed);
    state.follow_tx.send_replace(target);
    Ok(Reply::Simple("OK"))
}

fn aof_shrink(state: &Arc<AppState>) -> Result<Reply> {
    let (mut job, records) = {
        let mut store = state.write_store();
        let now = Instant::now();
        let records = snapshot_records(&store, now);
        let aof = store.aof.as_mut().ok_or(ServerError::AofDisabled)?;
        (aof.begin_shrink()?, records)
    };

    // The bulk write happens without the lock; concurrent appends land in
    // the live file and are copied as the tail at swap time.
    for record in &records {
        if let Err(e) = job.append_record(record) {
            let mut store = state.write_store();
            if let Some(aof) = store.aof.as_mut() {
                aof.abort_shrink(job);
            }
            return Err(e.into());
        }
    }

    let mut store = state.write_store();
    match store.aof.as_mut() {
        Some(aof) => aof.finish_shrink(job)?,
        None => return Err(ServerError::AofDisabled),
    }
    Ok(Reply::Simple("OK"))
}
