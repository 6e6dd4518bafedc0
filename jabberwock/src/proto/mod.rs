//! Low-level stream establishment

mod codec;
mod frame;
pub mod nonza;
mod xmpp_stream;

pub use codec::{Packet, XmppCodec};
pub use nonza::StreamFeatures;
pub(crate) use xmpp_stream::{add_stanza_id, make_id};
pub use xmpp_stream::XmppStream;
