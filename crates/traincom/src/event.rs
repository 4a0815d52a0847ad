use std::net::Ipv4Addr;

use traincom_wire::{MsgType, PdHeader};

use crate::error::PdError;

/// Snapshot of a telegram handed to application callbacks.
///
/// Built from the frame that triggered the event; `result` carries the
/// per-frame classification (`Ok` for accepted data, `Err(Timeout)` for a
/// watchdog episode, `Err(Topo)` for a rejected frame the subscriber still
/// hears about).
#[derive(Debug, Clone, Copy)]
pub struct PdInfo {
    pub com_id: u32,
    pub src: Ipv4Addr,
    pub dest: Ipv4Addr,
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
    pub msg_type: MsgType,
    pub seq: u32,
    pub proto_version: u16,
    pub reply_com_id: u32,
    pub reply_ip: Ipv4Addr,
    pub user_ref: u32,
    pub result: Result<(), PdError>,
}

impl PdInfo {
    pub(crate) fn from_header(
        header: &PdHeader,
        src: Ipv4Addr,
        dest: Ipv4Addr,
        user_ref: u32,
        result: Result<(), PdError>,
    ) -> Self {
        Self {
            com_id: header.com_id,
            src,
            dest,
            etb_topo_cnt: header.etb_topo_cnt,
            op_trn_topo_cnt: header.op_trn_topo_cnt,
            msg_type: header.msg_type,
            seq: header.sequence_counter,
            proto_version: header.protocol_version,
            reply_com_id: header.reply_com_id,
            reply_ip: header.reply_ip,
            user_ref,
            result,
        }
    }
}

/// Per-endpoint notification capability. Invoked inline on the engine
/// thread; implementations must return quickly and must not re-enter the
/// session.
pub trait PdCallback {
    fn on_pd_event(&mut self, info: &PdInfo, payload: &[u8]);
}

impl<F: FnMut(&PdInfo, &[u8])> PdCallback for F {
    fn on_pd_event(&mut self, info: &PdInfo, payload: &[u8]) {
        self(info, payload);
    }
}

/// Application marshalling seam. Registered once per session and applied
/// to endpoints carrying the MARSHALL flag; `marshall` may shrink the
/// payload, never grow it past the destination slice.
pub trait Marshaller {
    fn marshall(&mut self, com_id: u32, src: &[u8], dst: &mut [u8]) -> Result<usize, PdError>;
    fn unmarshall(&mut self, com_id: u32, src: &[u8], dst: &mut [u8]) -> Result<usize, PdError>;
}
