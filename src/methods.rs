//! Connection-class (class id 10) AMQP methods: the only methods the proxy
//! ever needs to understand, since everything past `Open`/`OpenOk` is
//! forwarded as opaque frames.
//!
//! Grounded on `libamqpprox/amqpprox_methods_start.cpp` for the decode/encode
//! shape, and `libamqpprox/amqpprox_connector.cpp` / `amqpprox_connectorutil.cpp`
//! for which methods the state machine touches and how `StartOk` is used to
//! splice in `amqpprox_client`/`amqpprox_host` identity fields.

use crate::fieldtable::{
    self, decode_field_table, decode_long_string, decode_short_string, encode_field_table,
    encode_long_string, encode_short_string, CodecError, FieldTable,
};
use bytes::{Buf, BufMut, BytesMut};

pub const CLASS_CONNECTION: u16 = 10;

pub const METHOD_START: u16 = 10;
pub const METHOD_START_OK: u16 = 11;
pub const METHOD_TUNE: u16 = 30;
pub const METHOD_TUNE_OK: u16 = 31;
pub const METHOD_OPEN: u16 = 40;
pub const METHOD_OPEN_OK: u16 = 41;
pub const METHOD_CLOSE: u16 = 50;
pub const METHOD_CLOSE_OK: u16 = 51;

/// The `(class, method)` pair carried by a decoded method frame's first four
/// bytes, used to dispatch in the connector state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader {
    pub class_id: u16,
    pub method_id: u16,
}

impl MethodHeader {
    pub const fn new(class_id: u16, method_id: u16) -> Self {
        Self { class_id, method_id }
    }

    pub fn is_connection_method(&self, method_id: u16) -> bool {
        self.class_id == CLASS_CONNECTION && self.method_id == method_id
    }
}

pub fn decode_method_header(payload: &[u8]) -> Result<(MethodHeader, &[u8]), CodecError> {
    if payload.len() < 4 {
        return Err(CodecError::Underrun {
            needed: 4,
            available: payload.len(),
        });
    }
    let class_id = u16::from_be_bytes([payload[0], payload[1]]);
    let method_id = u16::from_be_bytes([payload[2], payload[3]]);
    Ok((MethodHeader::new(class_id, method_id), &payload[4..]))
}

fn encode_method_header(out: &mut BytesMut, class_id: u16, method_id: u16) {
    out.put_u16(class_id);
    out.put_u16(method_id);
}

#[derive(Debug, Clone, PartialEq)]
pub struct Start {
    pub version_major: u8,
    pub version_minor: u8,
    pub properties: FieldTable,
    pub mechanisms: String,
    pub locales: String,
}

impl Start {
    pub fn decode(mut payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < 2 {
            return Err(CodecError::Underrun {
                needed: 2,
                available: payload.len(),
            });
        }
        let version_major = payload.get_u8();
        let version_minor = payload.get_u8();
        let properties = decode_field_table(&mut payload)?;
        let mechanisms = String::from_utf8_lossy(&decode_long_string(&mut payload)?).into_owned();
        let locales = String::from_utf8_lossy(&decode_long_string(&mut payload)?).into_owned();
        Ok(Self {
            version_major,
            version_minor,
            properties,
            mechanisms,
            locales,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        encode_method_header(out, CLASS_CONNECTION, METHOD_START);
        out.put_u8(self.version_major);
        out.put_u8(self.version_minor);
        encode_field_table(out, &self.properties)?;
        encode_long_string(out, self.mechanisms.as_bytes());
        encode_long_string(out, self.locales.as_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartOk {
    pub properties: FieldTable,
    pub mechanism: String,
    pub response: fieldtable::FieldValue,
    pub locale: String,
}

impl StartOk {
    pub fn decode(mut payload: &[u8]) -> Result<Self, CodecError> {
        let properties = decode_field_table(&mut payload)?;
        let mechanism = decode_short_string(&mut payload)?;
        let response = fieldtable::FieldValue::LongString(decode_long_string(&mut payload)?);
        let locale = decode_short_string(&mut payload)?;
        Ok(Self {
            properties,
            mechanism,
            response,
            locale,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        encode_method_header(out, CLASS_CONNECTION, METHOD_START_OK);
        encode_field_table(out, &self.properties)?;
        encode_short_string(out, &self.mechanism)?;
        let response_bytes = match &self.response {
            fieldtable::FieldValue::LongString(b) => b.clone(),
            _ => bytes::Bytes::new(),
        };
        encode_long_string(out, &response_bytes);
        encode_short_string(out, &self.locale)?;
        Ok(())
    }

    /// Add or overwrite the proxy-injected identity fields, mirroring
    /// `ConnectorUtil::injectProxyClientIdent`.
    pub fn inject_proxy_client_ident(
        &mut self,
        client_hostname: &str,
        client_remote_port: u16,
        local_hostname: &str,
        outbound_local_port: u16,
    ) {
        self.properties.set_long_string(
            "amqpprox_client",
            format!("{client_hostname}:{client_remote_port}"),
        );
        self.properties.set_long_string(
            "amqpprox_host",
            format!("{local_hostname}:{outbound_local_port}"),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tune {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl Tune {
    pub fn decode(mut payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < 8 {
            return Err(CodecError::Underrun {
                needed: 8,
                available: payload.len(),
            });
        }
        Ok(Self {
            channel_max: payload.get_u16(),
            frame_max: payload.get_u32(),
            heartbeat: payload.get_u16(),
        })
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        encode_method_header(out, CLASS_CONNECTION, METHOD_TUNE);
        out.put_u16(self.channel_max);
        out.put_u32(self.frame_max);
        out.put_u16(self.heartbeat);
        Ok(())
    }
}

pub type TuneOk = Tune;

pub fn decode_tune_ok(payload: &[u8]) -> Result<TuneOk, CodecError> {
    Tune::decode(payload)
}

pub fn encode_tune_ok(tune_ok: &TuneOk, out: &mut BytesMut) -> Result<(), CodecError> {
    encode_method_header(out, CLASS_CONNECTION, METHOD_TUNE_OK);
    out.put_u16(tune_ok.channel_max);
    out.put_u32(tune_ok.frame_max);
    out.put_u16(tune_ok.heartbeat);
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Open {
    pub virtual_host: String,
    pub capabilities: String,
    pub insist: bool,
}

impl Open {
    pub fn decode(mut payload: &[u8]) -> Result<Self, CodecError> {
        let virtual_host = decode_short_string(&mut payload)?;
        let capabilities = decode_short_string(&mut payload)?;
        if payload.is_empty() {
            return Err(CodecError::Underrun {
                needed: 1,
                available: 0,
            });
        }
        let insist = payload.get_u8() != 0;
        Ok(Self {
            virtual_host,
            capabilities,
            insist,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        encode_method_header(out, CLASS_CONNECTION, METHOD_OPEN);
        encode_short_string(out, &self.virtual_host)?;
        encode_short_string(out, &self.capabilities)?;
        out.put_u8(if self.insist { 1 } else { 0 });
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenOk {
    pub known_hosts: String,
}

impl OpenOk {
    pub fn decode(mut payload: &[u8]) -> Result<Self, CodecError> {
        let known_hosts = decode_short_string(&mut payload)?;
        Ok(Self { known_hosts })
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        encode_method_header(out, CLASS_CONNECTION, METHOD_OPEN_OK);
        encode_short_string(out, &self.known_hosts)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Close {
    pub reply_code: u16,
    pub reply_text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl Close {
    pub fn decode(mut payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < 2 {
            return Err(CodecError::Underrun {
                needed: 2,
                available: payload.len(),
            });
        }
        let reply_code = payload.get_u16();
        let reply_text = decode_short_string(&mut payload)?;
        if payload.len() < 4 {
            return Err(CodecError::Underrun {
                needed: 4,
                available: payload.len(),
            });
        }
        let class_id = payload.get_u16();
        let method_id = payload.get_u16();
        Ok(Self {
            reply_code,
            reply_text,
            class_id,
            method_id,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        encode_method_header(out, CLASS_CONNECTION, METHOD_CLOSE);
        out.put_u16(self.reply_code);
        encode_short_string(out, &self.reply_text)?;
        out.put_u16(self.class_id);
        out.put_u16(self.method_id);
        Ok(())
    }

    /// Overwrite the reply code/text, mirroring `Connector::synthesizeMessage`
    /// setting a canned `Reply` onto a reused `Close` method.
    pub fn set_reply(&mut self, code: u16, text: &str) {
        self.reply_code = code;
        self.reply_text = text.to_string();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseOk;

impl CloseOk {
    pub fn decode(_payload: &[u8]) -> Result<Self, CodecError> {
        Ok(Self)
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        encode_method_header(out, CLASS_CONNECTION, METHOD_CLOSE_OK);
        Ok(())
    }
}
