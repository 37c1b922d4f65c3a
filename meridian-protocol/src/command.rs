//! Command parsing: raw argument vectors into validated commands.
//!
//! Command names are case-insensitive. Each variant carries fully parsed
//! and validated arguments, so the dispatcher never re-inspects raw bytes.

use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use meridian_core::{parse_geojson, BBox, CmpOp, Geometry, Object, QueryOpts, WhereFilter};

/// GET output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetFormat {
    Object,
    Point,
    Bounds,
    Hash(usize),
}

/// Result shaping for the query commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOutput {
    #[default]
    Objects,
    Ids,
    Count,
}

/// A query region: inline geometry or a reference to a stored object.
#[derive(Debug, Clone)]
pub enum RegionSpec {
    Geometry(Geometry),
    Ref { key: String, id: String },
}

/// Session output dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Resp,
    Json,
}

#[derive(Debug, Clone)]
pub struct SetCmd {
    pub key: String,
    pub id: String,
    pub fields: Vec<(String, f64)>,
    pub ex: Option<f64>,
    pub object: Object,
}

#[derive(Debug, Clone)]
pub struct SearchCmd {
    pub key: String,
    pub opts: QueryOpts,
    pub output: QueryOutput,
    pub region: RegionSpec,
}

#[derive(Debug, Clone)]
pub struct NearbyCmd {
    pub key: String,
    pub opts: QueryOpts,
    pub output: QueryOutput,
    pub lon: f64,
    pub lat: f64,
    pub meters: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ScanCmd {
    pub key: String,
    pub opts: QueryOpts,
    pub output: QueryOutput,
}

/// Fence trigger and region of a SETHOOK.
#[derive(Debug, Clone)]
pub enum HookSpec {
    Nearby { key: String, region: Geometry },
    Within { key: String, region: Geometry },
    Intersects { key: String, region: Geometry },
    Roam { key: String, pattern: String, meters: f64 },
}

impl HookSpec {
    pub fn key(&self) -> &str {
        match self {
            HookSpec::Nearby { key, .. }
            | HookSpec::Within { key, .. }
            | HookSpec::Intersects { key, .. }
            | HookSpec::Roam { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SetHookCmd {
    pub name: String,
    pub endpoint: String,
    pub meta: Vec<(String, String)>,
    pub detect: Vec<String>,
    pub spec: HookSpec,
}

#[derive(Debug, Clone)]
pub enum Command {
    Ping,
    Output(Option<Dialect>),
    Auth { password: String },
    Set(SetCmd),
    Fset { key: String, id: String, field: String, value: f64 },
    Del { key: String, id: String },
    Drop { key: String },
    Get { key: String, id: String, format: GetFormat },
    Bounds { key: String },
    Keys { pattern: String },
    Stats { keys: Vec<String> },
    Server,
    Expire { key: String, id: String, seconds: f64 },
    Persist { key: String, id: String },
    Ttl { key: String, id: String },
    Scan(ScanCmd),
    Within(SearchCmd),
    Intersects(SearchCmd),
    Nearby(NearbyCmd),
    SetHook(SetHookCmd),
    DelHook { name: String },
    Hooks { pattern: String },
    AofShrink,
    ConfigGet { param: String },
    ConfigSet { param: String, value: String },
    Follow { target: Option<(String, u16)> },
    ReplConf { offset: u64 },
    Sync,
    /// Internal: first record of a shrunken AOF, carrying the logical byte
    /// offset at which the file begins.
    ReplBase { base: u64 },
}

/// Static routing facts about a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandDesc {
    pub name: &'static str,
    /// Appended to the AOF and forwarded to fences and followers.
    pub mutation: bool,
    /// Allowed before AUTH when a password is required.
    pub exempt_auth: bool,
}

impl Command {
    pub fn desc(&self) -> CommandDesc {
        use Command::*;
        let (name, mutation, exempt_auth) = match self {
            Ping => ("ping", false, false),
            Output(_) => ("output", false, false),
            Auth { .. } => ("auth", false, true),
            Set(_) => ("set", true, false),
            Fset { .. } => ("fset", true, false),
            Del { .. } => ("del", true, false),
            Drop { .. } => ("drop", true, false),
            Get { .. } => ("get", false, false),
            Bounds { .. } => ("bounds", false, false),
            Keys { .. } => ("keys", false, false),
            Stats { .. } => ("stats", false, false),
            Server => ("server", false, false),
            Expire { .. } => ("expire", true, false),
            Persist { .. } => ("persist", true, false),
            Ttl { .. } => ("ttl", false, false),
            Scan(_) => ("scan", false, false),
            Within(_) => ("within", false, false),
            Intersects(_) => ("intersects", false, false),
            Nearby(_) => ("nearby", false, false),
            SetHook(_) => ("sethook", true, false),
            DelHook { .. } => ("delhook", true, false),
            Hooks { .. } => ("hooks", false, false),
            AofShrink => ("aofshrink", false, false),
            ConfigGet { .. } => ("config", false, false),
            ConfigSet { .. } => ("config", false, false),
            Follow { .. } => ("follow", false, false),
            ReplConf { .. } => ("replconf", false, false),
            Sync => ("sync", false, false),
            ReplBase { .. } => ("replbase", true, false),
        };
        CommandDesc {
            name,
            mutation,
            exempt_auth,
        }
    }
}

// ---------------------------------------------------------------------------
// Argument cursor
// ---------------------------------------------------------------------------

struct Args<'a> {
    name: &'static str,
    args: &'a [Bytes],
    pos: usize,
}

impl<'a> Args<'a> {
    fn new(name: &'static str, args: &'a [Bytes]) -> Self {
        Self { name, args, pos: 0 }
    }

    fn arity_err<T>(&self) -> Result<T> {
        Err(ProtocolError::WrongArity(self.name))
    }

    fn remaining(&self) -> usize {
        self.args.len() - self.pos
    }

    fn next_str(&mut self) -> Result<String> {
        let Some(arg) = self.args.get(self.pos) else {
            return self.arity_err();
        };
        self.pos += 1;
        std::str::from_utf8(arg)
            .map(str::to_string)
            .map_err(|_| ProtocolError::Utf8)
    }

    fn next_f64(&mut self) -> Result<f64> {
        let s = self.next_str()?;
        s.parse()
            .map_err(|_| ProtocolError::InvalidArgument(s))
    }

    fn next_u64(&mut self) -> Result<u64> {
        let s = self.next_str()?;
        s.parse()
            .map_err(|_| ProtocolError::InvalidArgument(s))
    }

    /// Peek the next argument as an uppercase keyword, if it is UTF-8.
    fn peek_keyword(&self) -> Option<String> {
        self.args
            .get(self.pos)
            .and_then(|a| std::str::from_utf8(a).ok())
            .map(str::to_ascii_uppercase)
    }

    /// Consume the next argument when it equals the keyword.
    fn eat(&mut self, keyword: &str) -> bool {
        if self.peek_keyword().as_deref() == Some(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn finish<T>(&self, value: T) -> Result<T> {
        if self.remaining() == 0 {
            Ok(value)
        } else {
            self.arity_err()
        }
    }
}

// ---------------------------------------------------------------------------
// Shared clause parsers
// ---------------------------------------------------------------------------

/// `POINT lat lon [z]` — wire order is lat first.
fn parse_point(a: &mut Args<'_>, with_z: bool) -> Result<Geometry> {
    let lat = a.next_f64()?;
    let lon = a.next_f64()?;
    let z = if with_z && a.remaining() > 0 && a.peek_keyword().map_or(false, |k| k.parse::<f64>().is_ok()) {
        Some(a.next_f64()?)
    } else {
        None
    };
    Ok(Geometry::Point { lon, lat, z })
}

/// `BOUNDS minlat minlon maxlat maxlon`.
fn parse_bounds(a: &mut Args<'_>) -> Result<Geometry> {
    let min_lat = a.next_f64()?;
    let min_lon = a.next_f64()?;
    let max_lat = a.next_f64()?;
    let max_lon = a.next_f64()?;
    if min_lat > max_lat || min_lon > max_lon {
        return Err(ProtocolError::InvalidArgument("bounds are inverted".into()));
    }
    Ok(Geometry::Bounds(BBox::new(min_lon, min_lat, max_lon, max_lat)))
}

fn parse_object(a: &mut Args<'_>) -> Result<Geometry> {
    let raw = a.next_str()?;
    Ok(parse_geojson(&raw)?)
}

/// Leading `[CURSOR n] [LIMIT n] [WHERE f op v]… [IDS|COUNT]` clauses of the
/// query commands. Stops at the first unrecognized token.
fn parse_query_clauses(a: &mut Args<'_>) -> Result<(QueryOpts, QueryOutput)> {
    let mut opts = QueryOpts::default();
    let mut output = QueryOutput::default();
    loop {
        match a.peek_keyword().as_deref() {
            Some("CURSOR") => {
                a.pos += 1;
                opts.cursor = a.next_u64()? as usize;
            }
            Some("LIMIT") => {
                a.pos += 1;
                opts.limit = a.next_u64()? as usize;
            }
            Some("WHERE") => {
                a.pos += 1;
                let field = a.next_str()?;
                let op_str = a.next_str()?;
                let op = CmpOp::parse(&op_str)
                    .ok_or_else(|| ProtocolError::InvalidArgument(op_str))?;
                let value = a.next_f64()?;
                opts.wheres.push(WhereFilter { field, op, value });
            }
            Some("IDS") => {
                a.pos += 1;
                output = QueryOutput::Ids;
            }
            Some("COUNT") => {
                a.pos += 1;
                output = QueryOutput::Count;
            }
            _ => break,
        }
    }
    Ok((opts, output))
}

fn parse_region(a: &mut Args<'_>) -> Result<RegionSpec> {
    match a.peek_keyword().as_deref() {
        Some("GET") => {
            a.pos += 1;
            let key = a.next_str()?;
            let id = a.next_str()?;
            Ok(RegionSpec::Ref { key, id })
        }
        Some("POINT") => {
            a.pos += 1;
            let lat = a.next_f64()?;
            let lon = a.next_f64()?;
            let meters = a.next_f64()?;
            Ok(RegionSpec::Geometry(Geometry::Circle { lon, lat, meters }))
        }
        Some("BOUNDS") => {
            a.pos += 1;
            Ok(RegionSpec::Geometry(parse_bounds(a)?))
        }
        Some("OBJECT") => {
            a.pos += 1;
            Ok(RegionSpec::Geometry(parse_object(a)?))
        }
        _ => a.arity_err(),
    }
}

fn parse_set(a: &mut Args<'_>) -> Result<SetCmd> {
    let key = a.next_str()?;
    let id = a.next_str()?;
    if id.is_empty() {
        return Err(ProtocolError::InvalidArgument("empty id".into()));
    }
    let mut fields = Vec::new();
    let mut ex = None;
    let mut object = None;
    while a.remaining() > 0 {
        match a.peek_keyword().as_deref() {
            Some("FIELD") => {
                a.pos += 1;
                let name = a.next_str()?;
                let value = a.next_f64()?;
                fields.push((name, value));
            }
            Some("EX") => {
                a.pos += 1;
                let seconds = a.next_f64()?;
                if seconds < 0.0 {
                    return Err(ProtocolError::InvalidArgument("negative expiry".into()));
                }
                ex = Some(seconds);
            }
            Some("POINT") if object.is_none() => {
                a.pos += 1;
                object = Some(Object::Geo(parse_point(a, true)?));
            }
            Some("BOUNDS") if object.is_none() => {
                a.pos += 1;
                object = Some(Object::Geo(parse_bounds(a)?));
            }
            Some("OBJECT") if object.is_none() => {
                a.pos += 1;
                object = Some(Object::Geo(parse_object(a)?));
            }
            Some("STRING") if object.is_none() => {
                a.pos += 1;
                object = Some(Object::String(a.next_str()?));
            }
            _ => return a.arity_err(),
        }
    }
    let Some(object) = object else {
        return a.arity_err();
    };
    Ok(SetCmd {
        key,
        id,
        fields,
        ex,
        object,
    })
}

fn parse_search(a: &mut Args<'_>) -> Result<SearchCmd> {
    let key = a.next_str()?;
    let (opts, output) = parse_query_clauses(a)?;
    let region = parse_region(a)?;
    a.finish(SearchCmd {
        key,
        opts,
        output,
        region,
    })
}

fn parse_nearby(a: &mut Args<'_>) -> Result<NearbyCmd> {
    let key = a.next_str()?;
    let (opts, output) = parse_query_clauses(a)?;
    if !a.eat("POINT") {
        return a.arity_err();
    }
    let lat = a.next_f64()?;
    let lon = a.next_f64()?;
    let meters = if a.remaining() > 0 {
        Some(a.next_f64()?)
    } else {
        None
    };
    a.finish(NearbyCmd {
        key,
        opts,
        output,
        lon,
        lat,
        meters,
    })
}

const DETECT_KINDS: &[&str] = &["inside", "outside", "enter", "exit", "cross"];

fn parse_sethook(a: &mut Args<'_>) -> Result<SetHookCmd> {
    let name = a.next_str()?;
    let endpoint = a.next_str()?;
    let mut meta = Vec::new();
    while a.eat("META") {
        let k = a.next_str()?;
        let v = a.next_str()?;
        meta.push((k, v));
    }

    let trigger = a.next_str()?.to_ascii_uppercase();
    let key = a.next_str()?;
    let mut detect = Vec::new();
    let mut parse_detect = |a: &mut Args<'_>| -> Result<()> {
        if a.eat("DETECT") {
            let list = a.next_str()?;
            for kind in list.split(',') {
                let kind = kind.to_ascii_lowercase();
                if !DETECT_KINDS.contains(&kind.as_str()) {
                    return Err(ProtocolError::InvalidArgument(kind));
                }
                detect.push(kind);
            }
        }
        Ok(())
    };

    let spec = match trigger.as_str() {
        "ROAM" => {
            let pattern = a.next_str()?;
            let meters = a.next_f64()?;
            HookSpec::Roam {
                key,
                pattern,
                meters,
            }
        }
        "NEARBY" | "WITHIN" | "INTERSECTS" => {
            parse_detect(a)?;
            if !a.eat("FENCE") {
                return a.arity_err();
            }
            parse_detect(a)?;
            let region = match trigger.as_str() {
                "NEARBY" => {
                    if !a.eat("POINT") {
                        return a.arity_err();
                    }
                    let lat = a.next_f64()?;
                    let lon = a.next_f64()?;
                    let meters = a.next_f64()?;
                    Geometry::Circle { lon, lat, meters }
                }
                _ => match a.peek_keyword().as_deref() {
                    Some("BOUNDS") => {
                        a.pos += 1;
                        parse_bounds(a)?
                    }
                    Some("OBJECT") => {
                        a.pos += 1;
                        parse_object(a)?
                    }
                    _ => return a.arity_err(),
                },
            };
            match trigger.as_str() {
                "NEARBY" => HookSpec::Nearby { key, region },
                "WITHIN" => HookSpec::Within { key, region },
                _ => HookSpec::Intersects { key, region },
            }
        }
        other => return Err(ProtocolError::InvalidArgument(other.to_string())),
    };

    a.finish(SetHookCmd {
        name,
        endpoint,
        meta,
        detect,
        spec,
    })
}

impl Command {
    /// Parse a decoded argument vector into a command.
    pub fn parse(args: &[Bytes]) -> Result<Command> {
        let Some(first) = args.first() else {
            return Err(ProtocolError::Framing("empty command".into()));
        };
        let name = std::str::from_utf8(first)
            .map_err(|_| ProtocolError::Utf8)?
            .to_ascii_uppercase();
        let rest = &args[1..];

        match name.as_str() {
            "PING" => Args::new("ping", rest).finish(Command::Ping),
            "OUTPUT" => {
                let mut a = Args::new("output", rest);
                if a.remaining() == 0 {
                    return Ok(Command::Output(None));
                }
                let dialect = match a.next_str()?.to_ascii_lowercase().as_str() {
                    "json" => Dialect::Json,
                    "resp" => Dialect::Resp,
                    other => return Err(ProtocolError::InvalidArgument(other.to_string())),
                };
                a.finish(Command::Output(Some(dialect)))
            }
            "AUTH" => {
                let mut a = Args::new("auth", rest);
                let password = a.next_str()?;
                a.finish(Command::Auth { password })
            }
            "SET" => {
                let mut a = Args::new("set", rest);
                Ok(Command::Set(parse_set(&mut a)?))
            }
            "FSET" => {
                let mut a = Args::new("fset", rest);
                let key = a.next_str()?;
                let id = a.next_str()?;
                let field = a.next_str()?;
                let value = a.next_f64()?;
                a.finish(Command::Fset {
                    key,
                    id,
                    field,
                    value,
                })
            }
            "DEL" => {
                let mut a = Args::new("del", rest);
                let key = a.next_str()?;
                let id = a.next_str()?;
                a.finish(Command::Del { key, id })
            }
            "DROP" => {
                let mut a = Args::new("drop", rest);
                let key = a.next_str()?;
                a.finish(Command::Drop { key })
            }
            "GET" => {
                let mut a = Args::new("get", rest);
                let key = a.next_str()?;
                let id = a.next_str()?;
                let format = match a.peek_keyword().as_deref() {
                    None => GetFormat::Object,
                    Some("OBJECT") => {
                        a.pos += 1;
                        GetFormat::Object
                    }
                    Some("POINT") => {
                        a.pos += 1;
                        GetFormat::Point
                    }
                    Some("BOUNDS") => {
                        a.pos += 1;
                        GetFormat::Bounds
                    }
                    Some("HASH") => {
                        a.pos += 1;
                        let precision = a.next_u64()? as usize;
                        if precision == 0 || precision > 12 {
                            return Err(ProtocolError::InvalidArgument(precision.to_string()));
                        }
                        GetFormat::Hash(precision)
                    }
                    Some(other) => return Err(ProtocolError::InvalidArgument(other.to_string())),
                };
                a.finish(Command::Get { key, id, format })
            }
            "BOUNDS" => {
                let mut a = Args::new("bounds", rest);
                let key = a.next_str()?;
                a.finish(Command::Bounds { key })
            }
            "KEYS" => {
                let mut a = Args::new("keys", rest);
                let pattern = a.next_str()?;
                a.finish(Command::Keys { pattern })
            }
            "STATS" => {
                let mut a = Args::new("stats", rest);
                let mut keys = vec![a.next_str()?];
                while a.remaining() > 0 {
                    keys.push(a.next_str()?);
                }
                Ok(Command::Stats { keys })
            }
            "SERVER" => Args::new("server", rest).finish(Command::Server),
            "EXPIRE" => {
                let mut a = Args::new("expire", rest);
                let key = a.next_str()?;
                let id = a.next_str()?;
                let seconds = a.next_f64()?;
                if seconds < 0.0 {
                    return Err(ProtocolError::InvalidArgument("negative expiry".into()));
                }
                a.finish(Command::Expire { key, id, seconds })
            }
            "PERSIST" => {
                let mut a = Args::new("persist", rest);
                let key = a.next_str()?;
                let id = a.next_str()?;
                a.finish(Command::Persist { key, id })
            }
            "TTL" => {
                let mut a = Args::new("ttl", rest);
                let key = a.next_str()?;
                let id = a.next_str()?;
                a.finish(Command::Ttl { key, id })
            }
            "SCAN" => {
                let mut a = Args::new("scan", rest);
                let key = a.next_str()?;
                let (opts, output) = parse_query_clauses(&mut a)?;
                a.finish(Command::Scan(ScanCmd { key, opts, output }))
            }
            "WITHIN" => {
                let mut a = Args::new("within", rest);
                Ok(Command::Within(parse_search(&mut a)?))
            }
            "INTERSECTS" => {
                let mut a = Args::new("intersects", rest);
                Ok(Command::Intersects(parse_search(&mut a)?))
            }
            "NEARBY" => {
                let mut a = Args::new("nearby", rest);
                Ok(Command::Nearby(parse_nearby(&mut a)?))
            }
            "SETHOOK" => {
                let mut a = Args::new("sethook", rest);
                Ok(Command::SetHook(parse_sethook(&mut a)?))
            }
            "DELHOOK" => {
                let mut a = Args::new("delhook", rest);
                let name = a.next_str()?;
                a.finish(Command::DelHook { name })
            }
            "HOOKS" => {
                let mut a = Args::new("hooks", rest);
                let pattern = a.next_str()?;
                a.finish(Command::Hooks { pattern })
            }
            "AOFSHRINK" => Args::new("aofshrink", rest).finish(Command::AofShrink),
            "CONFIG" => {
                let mut a = Args::new("config", rest);
                let sub = a.next_str()?.to_ascii_uppercase();
                match sub.as_str() {
                    "GET" => {
                        let param = a.next_str()?;
                        a.finish(Command::ConfigGet { param })
                    }
                    "SET" => {
                        let param = a.next_str()?;
                        let value = a.next_str()?;
                        a.finish(Command::ConfigSet { param, value })
                    }
                    other => Err(ProtocolError::InvalidArgument(other.to_string())),
                }
            }
            "FOLLOW" => {
                let mut a = Args::new("follow", rest);
                let host = a.next_str()?;
                let port = a.next_str()?;
                if host.eq_ignore_ascii_case("no") && port.eq_ignore_ascii_case("one") {
                    return a.finish(Command::Follow { target: None });
                }
                let port: u16 = port
                    .parse()
                    .map_err(|_| ProtocolError::InvalidArgument(port))?;
                a.finish(Command::Follow {
                    target: Some((host, port)),
                })
            }
            "REPLCONF" => {
                let mut a = Args::new("replconf", rest);
                let sub = a.next_str()?.to_ascii_lowercase();
                if sub != "offset" {
                    return Err(ProtocolError::InvalidArgument(sub));
                }
                let offset = a.next_u64()?;
                a.finish(Command::ReplConf { offset })
            }
            "SYNC" => Args::new("sync", rest).finish(Command::Sync),
            "REPLBASE" => {
                let mut a = Args::new("replbase", rest);
                let base = a.next_u64()?;
                a.finish(Command::ReplBase { base })
            }
            _ => Err(ProtocolError::UnknownCommand(name.to_lowercase())),
        }
    }
}
