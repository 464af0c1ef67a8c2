//! Package envelope encode/decode.
//!
//! Every package serializes to a JSON object with a numeric `type` tag, the
//! originator `from`, and, for single-destination packages, `dest`. The tag
//! registry is closed for the core protocol; tags at or above
//! [`USER_TYPE_MIN`] are application-defined and round-trip through
//! [`CustomPackage`] with their raw JSON body intact.

use serde_json::{json, Map, Value};

use crate::tree::Tree;
use crate::NodeId;

/// First tag available for application-defined package types.
pub const USER_TYPE_MIN: u8 = 200;

/// Errors from package parse/serialize operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` has the wrong type")]
    BadField(&'static str),

    #[error("unknown package type: {0}")]
    UnknownType(u8),

    #[error("unknown time sync step: {0}")]
    UnknownTimeSyncStep(u8),
}

/// Frame priority. Lower discriminant is more urgent; the derived ordering
/// therefore sorts most-urgent first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    /// Convert from a raw level, clamping anything above 3 to `Low`.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Critical and High frames request an immediate transport flush.
    pub fn wants_flush(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

/// Canonical package tags. User-defined tags live at `>= USER_TYPE_MIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PackageType {
    TimeDelay = 3,
    TimeSync = 4,
    NodeSyncRequest = 5,
    NodeSyncReply = 6,
    Broadcast = 8,
    Single = 9,
    BridgeStatus = 10,
    GatewayData = 11,
    GatewayAck = 12,
}

impl PackageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            3 => Some(Self::TimeDelay),
            4 => Some(Self::TimeSync),
            5 => Some(Self::NodeSyncRequest),
            6 => Some(Self::NodeSyncReply),
            8 => Some(Self::Broadcast),
            9 => Some(Self::Single),
            10 => Some(Self::BridgeStatus),
            11 => Some(Self::GatewayData),
            12 => Some(Self::GatewayAck),
            _ => None,
        }
    }
}

/// Single-destination application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinglePackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub msg: String,
}

/// Mesh-wide application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPackage {
    pub from: NodeId,
    pub msg: String,
}

/// Application latency probe. The destination echoes the package back with
/// `from`/`dest` swapped and `time` untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeDelayPackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub time: u32,
}

/// One step of the three-message clock offset exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncStep {
    /// "Pull my time": ask the peer to start its own exchange against us.
    Request,
    /// T1 carrying the initiator's send time.
    Probe { t0: u32 },
    /// T2 carrying the probe time plus the responder's receive/send times.
    Reply { t0: u32, t1: u32, t2: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSyncPackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub msg: TimeSyncStep,
}

/// Topology advertisement. The sender's own subtree rides on the envelope:
/// `root`/`containsRoot`/`timeAuthority`/`subs` describe the node named by
/// `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSyncPackage {
    pub from: NodeId,
    pub tree: Tree,
}

/// Periodic broadcast from bridge-capable nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatusPackage {
    pub from: NodeId,
    pub internet_connected: bool,
    pub router_rssi: i8,
    pub router_channel: u8,
    pub uptime_ms: u32,
    pub gateway_ip: String,
    pub timestamp: u32,
}

/// Internet-bound request routed from any node to the primary gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDataPackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub message_id: u32,
    pub origin: NodeId,
    pub timestamp: u32,
    pub priority: Priority,
    pub destination_url: String,
    pub payload: String,
    pub content_type: String,
    pub retry_count: u8,
    pub requires_ack: bool,
}

/// Gateway response correlating a terminated Internet request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAckPackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub message_id: u32,
    pub origin: NodeId,
    pub success: bool,
    pub http_status: u16,
    pub error: String,
    pub timestamp: u32,
}

/// Application-defined package (tag >= [`USER_TYPE_MIN`]). The full JSON
/// object is preserved so user fields survive forwarding untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomPackage {
    pub tag: u8,
    pub from: NodeId,
    pub dest: Option<NodeId>,
    pub body: Map<String, Value>,
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Package {
    Single(SinglePackage),
    Broadcast(BroadcastPackage),
    TimeDelay(TimeDelayPackage),
    TimeSync(TimeSyncPackage),
    NodeSyncRequest(NodeSyncPackage),
    NodeSyncReply(NodeSyncPackage),
    BridgeStatus(BridgeStatusPackage),
    GatewayData(GatewayDataPackage),
    GatewayAck(GatewayAckPackage),
    Custom(CustomPackage),
}

impl Package {
    pub fn tag(&self) -> u8 {
        match self {
            Package::TimeDelay(_) => PackageType::TimeDelay as u8,
            Package::TimeSync(_) => PackageType::TimeSync as u8,
            Package::NodeSyncRequest(_) => PackageType::NodeSyncRequest as u8,
            Package::NodeSyncReply(_) => PackageType::NodeSyncReply as u8,
            Package::Broadcast(_) => PackageType::Broadcast as u8,
            Package::Single(_) => PackageType::Single as u8,
            Package::BridgeStatus(_) => PackageType::BridgeStatus as u8,
            Package::GatewayData(_) => PackageType::GatewayData as u8,
            Package::GatewayAck(_) => PackageType::GatewayAck as u8,
            Package::Custom(pkg) => pkg.tag,
        }
    }

    pub fn from(&self) -> NodeId {
        match self {
            Package::Single(p) => p.from,
            Package::Broadcast(p) => p.from,
            Package::TimeDelay(p) => p.from,
            Package::TimeSync(p) => p.from,
            Package::NodeSyncRequest(p) | Package::NodeSyncReply(p) => p.from,
            Package::BridgeStatus(p) => p.from,
            Package::GatewayData(p) => p.from,
            Package::GatewayAck(p) => p.from,
            Package::Custom(p) => p.from,
        }
    }

    /// Destination for single-destination packages, `None` for broadcasts.
    pub fn dest(&self) -> Option<NodeId> {
        match self {
            Package::Single(p) => Some(p.dest),
            Package::TimeDelay(p) => Some(p.dest),
            Package::TimeSync(p) => Some(p.dest),
            Package::GatewayData(p) => Some(p.dest),
            Package::GatewayAck(p) => Some(p.dest),
            Package::Custom(p) => p.dest,
            Package::Broadcast(_)
            | Package::NodeSyncRequest(_)
            | Package::NodeSyncReply(_)
            | Package::BridgeStatus(_) => None,
        }
    }

    /// Broadcast packages fan out to every neighbour except the inbound one.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Package::Broadcast(_) | Package::BridgeStatus(_))
            || matches!(self, Package::Custom(p) if p.dest.is_none())
    }

    pub fn to_value(&self) -> Value {
        let mut obj = match self {
            Package::Custom(p) => p.body.clone(),
            _ => Map::new(),
        };

        obj.insert("type".into(), json!(self.tag()));
        obj.insert("from".into(), json!(self.from()));
        if let Some(dest) = self.dest() {
            obj.insert("dest".into(), json!(dest));
        }

        match self {
            Package::Single(p) => {
                obj.insert("msg".into(), json!(p.msg));
            }
            Package::Broadcast(p) => {
                obj.insert("msg".into(), json!(p.msg));
            }
            Package::TimeDelay(p) => {
                obj.insert("time".into(), json!(p.time));
            }
            Package::TimeSync(p) => {
                let msg = match p.msg {
                    TimeSyncStep::Request => json!({ "type": 0 }),
                    TimeSyncStep::Probe { t0 } => json!({ "type": 1, "t0": t0 }),
                    TimeSyncStep::Reply { t0, t1, t2 } => {
                        json!({ "type": 2, "t0": t0, "t1": t1, "t2": t2 })
                    }
                };
                obj.insert("msg".into(), msg);
            }
            Package::NodeSyncRequest(p) | Package::NodeSyncReply(p) => {
                add_tree_attrs(&p.tree, &mut obj);
            }
            Package::BridgeStatus(p) => {
                obj.insert("internetConnected".into(), json!(p.internet_connected));
                obj.insert("routerRSSI".into(), json!(p.router_rssi));
                obj.insert("routerChannel".into(), json!(p.router_channel));
                obj.insert("uptime".into(), json!(p.uptime_ms));
                obj.insert("gatewayIP".into(), json!(p.gateway_ip));
                obj.insert("timestamp".into(), json!(p.timestamp));
            }
            Package::GatewayData(p) => {
                obj.insert("msgId".into(), json!(p.message_id));
                obj.insert("origin".into(), json!(p.origin));
                obj.insert("ts".into(), json!(p.timestamp));
                obj.insert("prio".into(), json!(p.priority.level()));
                obj.insert("dest_url".into(), json!(p.destination_url));
                obj.insert("payload".into(), json!(p.payload));
                obj.insert("content".into(), json!(p.content_type));
                obj.insert("retry".into(), json!(p.retry_count));
                obj.insert("ack".into(), json!(p.requires_ack));
            }
            Package::GatewayAck(p) => {
                obj.insert("msgId".into(), json!(p.message_id));
                obj.insert("origin".into(), json!(p.origin));
                obj.insert("success".into(), json!(p.success));
                obj.insert("http".into(), json!(p.http_status));
                obj.insert("err".into(), json!(p.error));
                obj.insert("ts".into(), json!(p.timestamp));
            }
            Package::Custom(_) => {}
        }

        Value::Object(obj)
    }

    pub fn from_value(value: &Value) -> Result<Package, ProtoError> {
        let obj = value.as_object().ok_or(ProtoError::NotAnObject)?;
        let tag = req_u8(obj, "type")?;
        let from = req_u32(obj, "from")?;

        if tag >= USER_TYPE_MIN {
            return Ok(Package::Custom(CustomPackage {
                tag,
                from,
                dest: opt_u32(obj, "dest")?,
                body: obj.clone(),
            }));
        }

        let package_type = PackageType::from_tag(tag).ok_or(ProtoError::UnknownType(tag))?;
        match package_type {
            PackageType::Single => Ok(Package::Single(SinglePackage {
                from,
                dest: req_u32(obj, "dest")?,
                msg: req_str(obj, "msg")?,
            })),
            PackageType::Broadcast => Ok(Package::Broadcast(BroadcastPackage {
                from,
                msg: req_str(obj, "msg")?,
            })),
            PackageType::TimeDelay => Ok(Package::TimeDelay(TimeDelayPackage {
                from,
                dest: req_u32(obj, "dest")?,
                time: req_u32(obj, "time")?,
            })),
            PackageType::TimeSync => {
                let msg = obj.get("msg").and_then(Value::as_object).ok_or(ProtoError::MissingField("msg"))?;
                let step = req_u8(msg, "type")?;
                let msg = match step {
                    0 => TimeSyncStep::Request,
                    1 => TimeSyncStep::Probe { t0: req_u32(msg, "t0")? },
                    2 => TimeSyncStep::Reply {
                        t0: req_u32(msg, "t0")?,
                        t1: req_u32(msg, "t1")?,
                        t2: req_u32(msg, "t2")?,
                    },
                    other => return Err(ProtoError::UnknownTimeSyncStep(other)),
                };
                Ok(Package::TimeSync(TimeSyncPackage {
                    from,
                    dest: req_u32(obj, "dest")?,
                    msg,
                }))
            }
            PackageType::NodeSyncRequest => Ok(Package::NodeSyncRequest(NodeSyncPackage {
                from,
                tree: tree_from_envelope(from, obj)?,
            })),
            PackageType::NodeSyncReply => Ok(Package::NodeSyncReply(NodeSyncPackage {
                from,
                tree: tree_from_envelope(from, obj)?,
            })),
            PackageType::BridgeStatus => Ok(Package::BridgeStatus(BridgeStatusPackage {
                from,
                internet_connected: req_bool(obj, "internetConnected")?,
                router_rssi: req_i8(obj, "routerRSSI")?,
                router_channel: req_u8(obj, "routerChannel")?,
                uptime_ms: req_u32(obj, "uptime")?,
                gateway_ip: req_str(obj, "gatewayIP")?,
                timestamp: req_u32(obj, "timestamp")?,
            })),
            PackageType::GatewayData => Ok(Package::GatewayData(GatewayDataPackage {
                from,
                dest: req_u32(obj, "dest")?,
                message_id: req_u32(obj, "msgId")?,
                origin: req_u32(obj, "origin")?,
                timestamp: req_u32(obj, "ts")?,
                priority: Priority::from_level(req_u8(obj, "prio")?),
                destination_url: req_str(obj, "dest_url")?,
                payload: req_str(obj, "payload")?,
                content_type: req_str(obj, "content")?,
                retry_count: req_u8(obj, "retry")?,
                requires_ack: req_bool(obj, "ack")?,
            })),
            PackageType::GatewayAck => Ok(Package::GatewayAck(GatewayAckPackage {
                from,
                dest: req_u32(obj, "dest")?,
                message_id: req_u32(obj, "msgId")?,
                origin: req_u32(obj, "origin")?,
                success: req_bool(obj, "success")?,
                http_status: req_u16(obj, "http")?,
                error: req_str(obj, "err")?,
                timestamp: req_u32(obj, "ts")?,
            })),
        }
    }

    /// Serialize to a frame body. The NUL terminator is added by the send
    /// buffer when the frame is served.
    pub fn encode(&self) -> Vec<u8> {
        self.to_value().to_string().into_bytes()
    }

    pub fn decode(body: &[u8]) -> Result<Package, ProtoError> {
        let value: Value = serde_json::from_slice(body)?;
        Package::from_value(&value)
    }
}

fn add_tree_attrs(tree: &Tree, obj: &mut Map<String, Value>) {
    if tree.root {
        obj.insert("root".into(), json!(true));
    }
    if tree.contains_root {
        obj.insert("containsRoot".into(), json!(true));
    }
    if tree.time_authority {
        obj.insert("timeAuthority".into(), json!(true));
    }
    if !tree.subs.is_empty() {
        obj.insert(
            "subs".into(),
            Value::Array(tree.subs.iter().map(Tree::to_value).collect()),
        );
    }
}

fn tree_from_envelope(from: NodeId, obj: &Map<String, Value>) -> Result<Tree, ProtoError> {
    let mut tree = Tree::new(from);
    tree.root = opt_bool(obj, "root");
    tree.contains_root = opt_bool(obj, "containsRoot");
    tree.time_authority = opt_bool(obj, "timeAuthority");
    if let Some(subs) = obj.get("subs") {
        let subs = subs.as_array().ok_or(ProtoError::BadField("subs"))?;
        tree.subs = subs.iter().map(Tree::from_value).collect::<Result<_, _>>()?;
    }
    Ok(tree)
}

fn req_u64(obj: &Map<String, Value>, key: &'static str) -> Result<u64, ProtoError> {
    obj.get(key)
        .ok_or(ProtoError::MissingField(key))?
        .as_u64()
        .ok_or(ProtoError::BadField(key))
}

fn req_u32(obj: &Map<String, Value>, key: &'static str) -> Result<u32, ProtoError> {
    u32::try_from(req_u64(obj, key)?).map_err(|_| ProtoError::BadField(key))
}

fn req_u16(obj: &Map<String, Value>, key: &'static str) -> Result<u16, ProtoError> {
    u16::try_from(req_u64(obj, key)?).map_err(|_| ProtoError::BadField(key))
}

fn req_u8(obj: &Map<String, Value>, key: &'static str) -> Result<u8, ProtoError> {
    u8::try_from(req_u64(obj, key)?).map_err(|_| ProtoError::BadField(key))
}

fn req_i8(obj: &Map<String, Value>, key: &'static str) -> Result<i8, ProtoError> {
    let raw = obj
        .get(key)
        .ok_or(ProtoError::MissingField(key))?
        .as_i64()
        .ok_or(ProtoError::BadField(key))?;
    i8::try_from(raw).map_err(|_| ProtoError::BadField(key))
}

fn req_bool(obj: &Map<String, Value>, key: &'static str) -> Result<bool, ProtoError> {
    obj.get(key)
        .ok_or(ProtoError::MissingField(key))?
        .as_bool()
        .ok_or(ProtoError::BadField(key))
}

fn req_str(obj: &Map<String, Value>, key: &'static str) -> Result<String, ProtoError> {
    Ok(obj
        .get(key)
        .ok_or(ProtoError::MissingField(key))?
        .as_str()
        .ok_or(ProtoError::BadField(key))?
        .to_string())
}

fn opt_u32(obj: &Map<String, Value>, key: &'static str) -> Result<Option<u32>, ProtoError> {
    match obj.get(key) {
        None => Ok(None),
        Some(value) => {
            let raw = value.as_u64().ok_or(ProtoError::BadField(key))?;
            Ok(Some(u32::try_from(raw).map_err(|_| ProtoError::BadField(key))?))
        }
    }
}

fn opt_bool(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(pkg: Package) -> Package {
        let decoded = Package::decode(&pkg.encode()).expect("decode failed");
        assert_eq!(decoded, pkg);
        decoded
    }

    #[test]
    fn roundtrip_single() {
        roundtrip(Package::Single(SinglePackage {
            from: 100,
            dest: 200,
            msg: "hello".into(),
        }));
    }

    #[test]
    fn roundtrip_broadcast() {
        let pkg = roundtrip(Package::Broadcast(BroadcastPackage {
            from: 100,
            msg: "everyone".into(),
        }));
        assert!(pkg.is_broadcast());
        assert_eq!(pkg.dest(), None);
    }

    #[test]
    fn roundtrip_time_delay() {
        roundtrip(Package::TimeDelay(TimeDelayPackage { from: 1, dest: 2, time: 123_456 }));
    }

    #[test]
    fn roundtrip_time_sync_all_steps() {
        for msg in [
            TimeSyncStep::Request,
            TimeSyncStep::Probe { t0: 10 },
            TimeSyncStep::Reply { t0: 10, t1: 20, t2: 30 },
        ] {
            roundtrip(Package::TimeSync(TimeSyncPackage { from: 1, dest: 2, msg }));
        }
    }

    #[test]
    fn roundtrip_node_sync_with_subtree() {
        let mut tree = Tree::new(7);
        tree.root = true;
        tree.contains_root = true;
        let mut child = Tree::new(8);
        child.subs.push(Tree::new(9));
        tree.subs.push(child);

        let pkg = roundtrip(Package::NodeSyncRequest(NodeSyncPackage { from: 7, tree }));
        match pkg {
            Package::NodeSyncRequest(p) => {
                assert!(p.tree.root);
                assert!(p.tree.contains(9));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn roundtrip_bridge_status() {
        roundtrip(Package::BridgeStatus(BridgeStatusPackage {
            from: 42,
            internet_connected: true,
            router_rssi: -55,
            router_channel: 6,
            uptime_ms: 90_000,
            gateway_ip: "192.168.1.1".into(),
            timestamp: 1_000,
        }));
    }

    #[test]
    fn roundtrip_gateway_data() {
        roundtrip(Package::GatewayData(GatewayDataPackage {
            from: 1,
            dest: 2,
            message_id: 0x0001_0007,
            origin: 1,
            timestamp: 555,
            priority: Priority::High,
            destination_url: "https://example.org/ingest".into(),
            payload: "{\"temp\":21}".into(),
            content_type: "application/json".into(),
            retry_count: 1,
            requires_ack: true,
        }));
    }

    #[test]
    fn roundtrip_gateway_ack() {
        roundtrip(Package::GatewayAck(GatewayAckPackage {
            from: 2,
            dest: 1,
            message_id: 0x0001_0007,
            origin: 1,
            success: false,
            http_status: 503,
            error: "upstream unavailable".into(),
            timestamp: 999,
        }));
    }

    #[test]
    fn custom_package_preserves_user_fields() {
        let body = json!({ "type": 210, "from": 5, "dest": 6, "sensor": "door", "open": true });
        let pkg = Package::from_value(&body).expect("custom parse");
        assert_eq!(pkg.tag(), 210);
        assert_eq!(pkg.dest(), Some(6));

        let reencoded = pkg.to_value();
        assert_eq!(reencoded.get("sensor").and_then(Value::as_str), Some("door"));
        assert_eq!(reencoded.get("open").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn custom_package_without_dest_is_broadcast() {
        let body = json!({ "type": 200, "from": 5, "blob": [1, 2, 3] });
        let pkg = Package::from_value(&body).expect("custom parse");
        assert!(pkg.is_broadcast());
    }

    #[test]
    fn rejects_unknown_core_tag() {
        let body = json!({ "type": 7, "from": 5 });
        assert!(matches!(Package::from_value(&body), Err(ProtoError::UnknownType(7))));
    }

    #[test]
    fn rejects_missing_type() {
        let body = json!({ "from": 5 });
        assert!(matches!(Package::from_value(&body), Err(ProtoError::MissingField("type"))));
    }

    #[test]
    fn rejects_non_object_frame() {
        assert!(matches!(Package::decode(b"[1,2,3]"), Err(ProtoError::NotAnObject)));
    }

    #[test]
    fn priority_clamps_and_orders() {
        assert_eq!(Priority::from_level(0), Priority::Critical);
        assert_eq!(Priority::from_level(9), Priority::Low);
        assert!(Priority::Critical < Priority::Low);
        assert!(Priority::Critical.wants_flush());
        assert!(!Priority::Normal.wants_flush());
    }
}
