//! WAMP message codec: a tagged union over the 14 message codes this router
//! speaks, with typed constructors and a central encode/decode path keyed on
//! the integer code in element 0 of the JSON array framing.

mod code;

pub use code::{is_error_prone_code, Code};

use serde_json::{json, Value};

use crate::error::{Error, ErrorKind};
use crate::{Dict, List, WampResult, ID};

/// Any WAMP message this router can send or receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello {
        realm: String,
        details: Dict,
    },
    Welcome {
        session_id: ID,
        details: Dict,
    },
    Abort {
        details: Dict,
        reason: String,
    },
    Goodbye {
        details: Dict,
        reason: String,
    },
    Error {
        request_code: u64,
        request_id: ID,
        details: Dict,
        uri: String,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    Publish {
        request_id: ID,
        options: Dict,
        topic: String,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    Published {
        request_id: ID,
        publication_id: ID,
    },
    Subscribe {
        request_id: ID,
        options: Dict,
        topic: String,
    },
    Subscribed {
        request_id: ID,
        subscription_id: ID,
    },
    Unsubscribe {
        request_id: ID,
        subscription_id: ID,
    },
    Unsubscribed {
        request_id: ID,
    },
    Event {
        subscription_id: ID,
        publication_id: ID,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    Call {
        request_id: ID,
        options: Dict,
        procedure: String,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    Result {
        request_id: ID,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    /// A code this router has no processor for. Routed by the dispatcher to
    /// an "unsupported message" `ERROR` responder.
    Unknown {
        code: u64,
        raw: List,
    },
}

impl Message {
    pub fn code(&self) -> u64 {
        match self {
            Message::Hello { .. } => Code::Hello.as_u64(),
            Message::Welcome { .. } => Code::Welcome.as_u64(),
            Message::Abort { .. } => Code::Abort.as_u64(),
            Message::Goodbye { .. } => Code::Goodbye.as_u64(),
            Message::Error { .. } => Code::Error.as_u64(),
            Message::Publish { .. } => Code::Publish.as_u64(),
            Message::Published { .. } => Code::Published.as_u64(),
            Message::Subscribe { .. } => Code::Subscribe.as_u64(),
            Message::Subscribed { .. } => Code::Subscribed.as_u64(),
            Message::Unsubscribe { .. } => Code::Unsubscribe.as_u64(),
            Message::Unsubscribed { .. } => Code::Unsubscribed.as_u64(),
            Message::Event { .. } => Code::Event.as_u64(),
            Message::Call { .. } => Code::Call.as_u64(),
            Message::Result { .. } => Code::Result.as_u64(),
            Message::Unknown { code, .. } => *code,
        }
    }

    /// The `request_id` carried by request-bearing variants, if any.
    pub fn request_id(&self) -> Option<ID> {
        match self {
            Message::Error { request_id, .. }
            | Message::Publish { request_id, .. }
            | Message::Published { request_id, .. }
            | Message::Subscribe { request_id, .. }
            | Message::Subscribed { request_id, .. }
            | Message::Unsubscribe { request_id, .. }
            | Message::Unsubscribed { request_id }
            | Message::Call { request_id, .. }
            | Message::Result { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    // ---- constructors -------------------------------------------------

    pub fn hello(realm: impl Into<String>, details: Dict) -> Message {
        Message::Hello {
            realm: realm.into(),
            details,
        }
    }

    pub fn welcome(session_id: ID, details: Dict) -> Message {
        Message::Welcome {
            session_id,
            details,
        }
    }

    /// WELCOME carrying the router's default broker/dealer feature
    /// advertisement (§4.5).
    pub fn welcome_with_defaults(session_id: ID) -> Message {
        Message::welcome(session_id, default_welcome_details())
    }

    /// `reason` is a required parameter, not an `Option`: the type system
    /// enforces what the original router checked with a runtime assertion
    /// ("AbortMessage must have a reason").
    pub fn abort(reason: impl Into<String>, details: Dict) -> Message {
        Message::Abort {
            details,
            reason: reason.into(),
        }
    }

    pub fn abort_unauthorized(message: impl Into<String>) -> Message {
        let mut details = Dict::new();
        details.insert("message".to_string(), Value::String(message.into()));
        Message::abort("tornwamp.error.unauthorized", details)
    }

    pub fn goodbye(details: Dict, reason: impl Into<String>) -> Message {
        Message::Goodbye {
            details,
            reason: reason.into(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn error(
        request_code: u64,
        request_id: ID,
        uri: impl Into<String>,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Message {
        Message::Error {
            request_code,
            request_id,
            details,
            uri: uri.into(),
            args,
            kwargs,
        }
    }

    /// `ERROR` carrying only a human-readable `message` in its details, the
    /// shape every processor in this router actually sends.
    pub fn error_with_message(
        request_code: u64,
        request_id: ID,
        uri: impl Into<String>,
        message: impl Into<String>,
    ) -> Message {
        let mut details = Dict::new();
        details.insert("message".to_string(), Value::String(message.into()));
        Message::error(request_code, request_id, uri, details, None, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        request_id: ID,
        options: Dict,
        topic: impl Into<String>,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Message {
        Message::Publish {
            request_id,
            options,
            topic: topic.into(),
            args,
            kwargs,
        }
    }

    pub fn published(request_id: ID, publication_id: ID) -> Message {
        Message::Published {
            request_id,
            publication_id,
        }
    }

    pub fn subscribe(request_id: ID, options: Dict, topic: impl Into<String>) -> Message {
        Message::Subscribe {
            request_id,
            options,
            topic: topic.into(),
        }
    }

    pub fn subscribed(request_id: ID, subscription_id: ID) -> Message {
        Message::Subscribed {
            request_id,
            subscription_id,
        }
    }

    pub fn unsubscribe(request_id: ID, subscription_id: ID) -> Message {
        Message::Unsubscribe {
            request_id,
            subscription_id,
        }
    }

    pub fn unsubscribed(request_id: ID) -> Message {
        Message::Unsubscribed { request_id }
    }

    pub fn event(
        subscription_id: ID,
        publication_id: ID,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Message {
        Message::Event {
            subscription_id,
            publication_id,
            details,
            args,
            kwargs,
        }
    }

    pub fn call(
        request_id: ID,
        options: Dict,
        procedure: impl Into<String>,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Message {
        Message::Call {
            request_id,
            options,
            procedure: procedure.into(),
            args,
            kwargs,
        }
    }

    pub fn result(
        request_id: ID,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Message {
        Message::Result {
            request_id,
            details,
            args,
            kwargs,
        }
    }

    // ---- codec ----------------------------------------------------------

    /// Encode as the canonical JSON array value for this variant. Variadic
    /// `args`/`kwargs` tails follow the bit-exact rule in §4.2: present only
    /// when the source constructor was given `Some`, kwargs forces args to
    /// be rendered (defaulting to `[]`), both `None` yields no tail at all.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Hello { realm, details } => {
                json!([Code::Hello.as_u64(), realm, details])
            }
            Message::Welcome {
                session_id,
                details,
            } => json!([Code::Welcome.as_u64(), session_id, details]),
            Message::Abort { details, reason } => {
                json!([Code::Abort.as_u64(), details, reason])
            }
            Message::Goodbye { details, reason } => {
                json!([Code::Goodbye.as_u64(), details, reason])
            }
            Message::Error {
                request_code,
                request_id,
                details,
                uri,
                args,
                kwargs,
            } => with_tail(
                vec![
                    json!(Code::Error.as_u64()),
                    json!(request_code),
                    json!(request_id),
                    json!(details),
                    json!(uri),
                ],
                args,
                kwargs,
            ),
            Message::Publish {
                request_id,
                options,
                topic,
                args,
                kwargs,
            } => with_tail(
                vec![
                    json!(Code::Publish.as_u64()),
                    json!(request_id),
                    json!(options),
                    json!(topic),
                ],
                args,
                kwargs,
            ),
            Message::Published {
                request_id,
                publication_id,
            } => json!([Code::Published.as_u64(), request_id, publication_id]),
            Message::Subscribe {
                request_id,
                options,
                topic,
            } => json!([Code::Subscribe.as_u64(), request_id, options, topic]),
            Message::Subscribed {
                request_id,
                subscription_id,
            } => json!([Code::Subscribed.as_u64(), request_id, subscription_id]),
            Message::Unsubscribe {
                request_id,
                subscription_id,
            } => json!([Code::Unsubscribe.as_u64(), request_id, subscription_id]),
            Message::Unsubscribed { request_id } => {
                json!([Code::Unsubscribed.as_u64(), request_id])
            }
            Message::Event {
                subscription_id,
                publication_id,
                details,
                args,
                kwargs,
            } => with_tail(
                vec![
                    json!(Code::Event.as_u64()),
                    json!(subscription_id),
                    json!(publication_id),
                    json!(details),
                ],
                args,
                kwargs,
            ),
            Message::Call {
                request_id,
                options,
                procedure,
                args,
                kwargs,
            } => with_tail(
                vec![
                    json!(Code::Call.as_u64()),
                    json!(request_id),
                    json!(options),
                    json!(procedure),
                ],
                args,
                kwargs,
            ),
            Message::Result {
                request_id,
                details,
                args,
                kwargs,
            } => with_tail(
                vec![json!(Code::Result.as_u64()), json!(request_id), json!(details)],
                args,
                kwargs,
            ),
            Message::Unknown { code, raw } => {
                let mut arr = vec![json!(code)];
                arr.extend(raw.iter().cloned());
                Value::Array(arr)
            }
        }
    }

    pub fn json(&self) -> String {
        // Array values built from `json!` always serialize; unwrap is safe.
        serde_json::to_string(&self.to_value()).expect("message array always serializes")
    }

    pub fn from_text(text: &str) -> WampResult<Message> {
        let value: Value = serde_json::from_str(text).map_err(|e| Error::new(ErrorKind::JSONError(e)))?;
        Message::decode(value)
    }

    pub fn decode(value: Value) -> WampResult<Message> {
        let arr = value
            .as_array()
            .ok_or_else(|| protocol("WAMP message must be a JSON array"))?;
        let code = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| protocol("WAMP message missing integer code in element 0"))?;

        match Code::try_from(code) {
            Ok(Code::Hello) => {
                let realm = str_at(arr, 1, "Hello message ended before realm uri")?;
                let details = dict_at(arr, 2, "Hello message ended before details dict")?;
                Ok(Message::hello(realm, details))
            }
            Ok(Code::Welcome) => {
                let session_id = id_at(arr, 1, "Welcome message ended before session id")?;
                let details = dict_at(arr, 2, "Welcome message ended before details dict")?;
                Ok(Message::welcome(session_id, details))
            }
            Ok(Code::Abort) => {
                let details = dict_at(arr, 1, "Abort message ended before details dict")?;
                let reason = str_at(arr, 2, "Abort message ended before reason uri")?;
                Ok(Message::abort(reason, details))
            }
            Ok(Code::Goodbye) => {
                let details = dict_at(arr, 1, "Goodbye message ended before details dict")?;
                let reason = str_at(arr, 2, "Goodbye message ended before reason uri")?;
                Ok(Message::goodbye(details, reason))
            }
            Ok(Code::Error) => {
                let request_code = u64_at(arr, 1, "Error message ended before request code")?;
                let request_id = id_at(arr, 2, "Error message ended before request id")?;
                let details = dict_at(arr, 3, "Error message ended before details dict")?;
                let uri = str_at(arr, 4, "Error message ended before error uri")?;
                let (args, kwargs) = tail_at(arr, 5)?;
                Ok(Message::error(request_code, request_id, uri, details, args, kwargs))
            }
            Ok(Code::Publish) => {
                let request_id = id_at(arr, 1, "Publish message ended before request id")?;
                let options = dict_at(arr, 2, "Publish message ended before options dict")?;
                let topic = str_at(arr, 3, "Publish message ended before topic uri")?;
                let (args, kwargs) = tail_at(arr, 4)?;
                Ok(Message::publish(request_id, options, topic, args, kwargs))
            }
            Ok(Code::Published) => {
                let request_id = id_at(arr, 1, "Published message ended before request id")?;
                let publication_id =
                    id_at(arr, 2, "Published message ended before publication id")?;
                Ok(Message::published(request_id, publication_id))
            }
            Ok(Code::Subscribe) => {
                let request_id = id_at(arr, 1, "Subscribe message ended before request id")?;
                let options = dict_at(arr, 2, "Subscribe message ended before options dict")?;
                let topic = str_at(arr, 3, "Subscribe message ended before topic uri")?;
                Ok(Message::subscribe(request_id, options, topic))
            }
            Ok(Code::Subscribed) => {
                let request_id = id_at(arr, 1, "Subscribed message ended before request id")?;
                let subscription_id =
                    id_at(arr, 2, "Subscribed message ended before subscription id")?;
                Ok(Message::subscribed(request_id, subscription_id))
            }
            Ok(Code::Unsubscribe) => {
                let request_id = id_at(arr, 1, "Unsubscribe message ended before request id")?;
                let subscription_id =
                    id_at(arr, 2, "Unsubscribe message ended before subscription id")?;
                Ok(Message::unsubscribe(request_id, subscription_id))
            }
            Ok(Code::Unsubscribed) => {
                let request_id = id_at(arr, 1, "Unsubscribed message ended before request id")?;
                Ok(Message::unsubscribed(request_id))
            }
            Ok(Code::Event) => {
                let subscription_id = id_at(arr, 1, "Event message ended before subscription id")?;
                let publication_id = id_at(arr, 2, "Event message ended before publication id")?;
                let details = dict_at(arr, 3, "Event message ended before details dict")?;
                let (args, kwargs) = tail_at(arr, 4)?;
                Ok(Message::event(subscription_id, publication_id, details, args, kwargs))
            }
            Ok(Code::Call) => {
                let request_id = id_at(arr, 1, "Call message ended before request id")?;
                let options = dict_at(arr, 2, "Call message ended before options dict")?;
                let procedure = str_at(arr, 3, "Call message ended before procedure uri")?;
                let (args, kwargs) = tail_at(arr, 4)?;
                Ok(Message::call(request_id, options, procedure, args, kwargs))
            }
            Ok(Code::Result) => {
                let request_id = id_at(arr, 1, "Result message ended before request id")?;
                let details = dict_at(arr, 2, "Result message ended before details dict")?;
                let (args, kwargs) = tail_at(arr, 3)?;
                Ok(Message::result(request_id, details, args, kwargs))
            }
            Err(()) => Ok(Message::Unknown {
                code,
                raw: arr[1..].to_vec(),
            }),
        }
    }
}

/// `build_error_for` (§4.2): an `ERROR` targeting `in_message`'s request, or
/// `None` if `in_message`'s code does not receive error replies.
pub fn build_error_for(in_message: &Message, uri: &str, description: &str) -> Option<Message> {
    let request_code = in_message.code();
    if !is_error_prone_code(request_code) {
        return None;
    }
    let request_id = in_message.request_id()?;
    Some(Message::error_with_message(
        request_code,
        request_id,
        uri,
        description,
    ))
}

/// The feature set advertised in every `WELCOME` (§4.5): publisher
/// identification, publisher exclusion, subscriber blackwhite listing for
/// the broker role; progressive call results and caller identification for
/// the dealer role.
pub fn default_welcome_details() -> Dict {
    match json!({
        "roles": {
            "broker": {
                "features": {
                    "publisher_identification": true,
                    "publisher_exclusion": true,
                    "subscriber_blackwhite_listing": true
                }
            },
            "dealer": {
                "features": {
                    "progressive_call_results": true,
                    "caller_identification": true
                }
            }
        }
    }) {
        Value::Object(map) => map,
        _ => unreachable!("object literal always serializes to an object"),
    }
}

/// Internal envelope carried on the Redis bus for cross-node delivery. Not a
/// WAMP wire message; has its own JSON round-trip (§3, §6).
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    pub topic_name: String,
    pub event_message: Message,
    pub publisher_connection_id: Option<ID>,
    pub publisher_node_id: String,
}

impl BroadcastMessage {
    pub fn new(
        topic_name: impl Into<String>,
        event_message: Message,
        publisher_connection_id: Option<ID>,
        publisher_node_id: impl Into<String>,
    ) -> BroadcastMessage {
        BroadcastMessage {
            topic_name: topic_name.into(),
            event_message,
            publisher_connection_id,
            publisher_node_id: publisher_node_id.into(),
        }
    }

    pub fn to_json(&self) -> String {
        let value = json!({
            "topic_name": self.topic_name,
            "event_message": self.event_message.to_value(),
            "publisher_connection_id": self.publisher_connection_id,
            "publisher_node_id": self.publisher_node_id,
        });
        serde_json::to_string(&value).expect("broadcast envelope always serializes")
    }

    pub fn from_json(text: &str) -> WampResult<BroadcastMessage> {
        let value: Value = serde_json::from_str(text).map_err(|e| Error::new(ErrorKind::JSONError(e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| protocol("broadcast envelope must be a JSON object"))?;
        let topic_name = obj
            .get("topic_name")
            .and_then(Value::as_str)
            .ok_or_else(|| protocol("broadcast envelope missing topic_name"))?
            .to_string();
        let event_value = obj
            .get("event_message")
            .cloned()
            .ok_or_else(|| protocol("broadcast envelope missing event_message"))?;
        let event_message = Message::decode(event_value)?;
        if !matches!(event_message, Message::Event { .. }) {
            return Err(protocol("broadcast envelope event_message must be an EVENT"));
        }
        let publisher_connection_id = obj.get("publisher_connection_id").and_then(Value::as_u64);
        let publisher_node_id = obj
            .get("publisher_node_id")
            .and_then(Value::as_str)
            .ok_or_else(|| protocol("broadcast envelope missing publisher_node_id"))?
            .to_string();
        Ok(BroadcastMessage {
            topic_name,
            event_message,
            publisher_connection_id,
            publisher_node_id,
        })
    }
}

// ---- decode helpers -----------------------------------------------------

fn protocol(msg: &str) -> Error {
    Error::new(ErrorKind::Protocol(msg.to_string()))
}

fn with_tail(mut base: Vec<Value>, args: &Option<List>, kwargs: &Option<Dict>) -> Value {
    match kwargs {
        Some(kwargs) => {
            base.push(json!(args.clone().unwrap_or_default()));
            base.push(json!(kwargs));
        }
        None => {
            if let Some(args) = args {
                base.push(json!(args));
            }
        }
    }
    Value::Array(base)
}

fn u64_at(arr: &[Value], index: usize, msg: &str) -> WampResult<u64> {
    arr.get(index).and_then(Value::as_u64).ok_or_else(|| protocol(msg))
}

fn id_at(arr: &[Value], index: usize, msg: &str) -> WampResult<ID> {
    u64_at(arr, index, msg)
}

fn str_at(arr: &[Value], index: usize, msg: &str) -> WampResult<String> {
    arr.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| protocol(msg))
}

fn dict_at(arr: &[Value], index: usize, msg: &str) -> WampResult<Dict> {
    arr.get(index)
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| protocol(msg))
}

/// Decode the variadic `[args]` / `[args, kwargs]` / `[]` tail starting at
/// `index`, the inverse of `with_tail`.
fn tail_at(arr: &[Value], index: usize) -> WampResult<(Option<List>, Option<Dict>)> {
    let args = match arr.get(index) {
        None => None,
        Some(v) => Some(
            v.as_array()
                .cloned()
                .ok_or_else(|| protocol("message args must be an array"))?,
        ),
    };
    let kwargs = match arr.get(index + 1) {
        None => None,
        Some(v) => Some(
            v.as_object()
                .cloned()
                .ok_or_else(|| protocol("message kwargs must be an object"))?,
        ),
    };
    Ok((args, kwargs))
}
