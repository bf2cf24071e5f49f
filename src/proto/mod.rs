//! PDU framing, the typed field codec, and the service/opcode dispatch
//! tables that route decoded PDUs to handlers.

pub mod pdu;

pub use pdu::{
    is_notification_opcode, BdAddr, BdName, PinCode, Pdu, PduReader, PduWriter, Property, Uuid,
    HEADER_LEN, NOTIFICATION_BIT,
};
