//! Minimal MQTT 3.1.1 wire protocol.
//!
//! Only the subset the driver protocol needs: QoS 0 publish/subscribe with
//! authentication and last-will support. QoS 1/2 delivery, retained
//! message storage and session resumption are deliberately absent.

pub mod codec;
pub mod packet;

pub use codec::MqttCodec;
pub use packet::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Packet, Publish, SubAck, Subscribe, Unsubscribe,
};
