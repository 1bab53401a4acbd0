//! Channel messages produced by the status store

use crate::channel::{ChannelKind, Envelope, Posting};
use crate::util::nlencode;

use super::host::HostMeta;
use super::record::LogRecord;

/// Everything needed to describe one record on a channel
pub(crate) struct RecordView<'a> {
    pub host: &'a HostMeta,
    pub test: &'a str,
    pub record: &'a LogRecord,
    pub sender: &'a str,
}

impl RecordView<'_> {
    fn envelope(&self, marker: &str) -> Envelope {
        Envelope::new(marker, self.host.name.as_str(), self.sender)
    }

    fn client_ts(&self) -> i64 {
        self.record.client_ts.unwrap_or(0)
    }
}

pub(crate) fn status(view: &RecordView<'_>) -> Posting {
    let r = view.record;
    let envelope = view
        .envelope("status")
        .field(&r.origin)
        .field(&view.host.name)
        .field(view.test)
        .field(r.valid_until)
        .field(r.color)
        .field(nlencode(r.testflags.as_deref().unwrap_or("")))
        .field(r.old_color)
        .field(r.last_change)
        .field(r.ack_time())
        .field(nlencode(r.ack_message()))
        .field(r.enable_time())
        .field(nlencode(r.disable_message()))
        .field(view.client_ts())
        .field(view.host.class.as_deref().unwrap_or(""))
        .field(view.host.page_path())
        .field(if r.flapping { 1 } else { 0 })
        .field(r.modifier_summary())
        .body(r.message.as_str());
    Posting::to(ChannelKind::Status, envelope)
}

pub(crate) fn stachg(view: &RecordView<'_>) -> Posting {
    let r = view.record;
    let envelope = view
        .envelope("stachg")
        .field(&r.origin)
        .field(&view.host.name)
        .field(view.test)
        .field(r.valid_until)
        .field(r.color)
        .field(r.old_color)
        .field(r.last_change)
        .field(r.enable_time())
        .field(nlencode(r.disable_message()))
        .field(0)
        .field(view.client_ts())
        .field(r.modifier_summary())
        .body(r.message.as_str());
    Posting::to(ChannelKind::Stachg, envelope)
}

pub(crate) fn page(view: &RecordView<'_>) -> Posting {
    let r = view.record;
    let cookie = r.cookie_value().map_or(-1, i64::from);
    let envelope = view
        .envelope("page")
        .field(&view.host.name)
        .field(view.test)
        .field(view.host.ip_string())
        .field(r.valid_until)
        .field(r.color)
        .field(r.old_color)
        .field(r.last_change)
        .field(view.host.page_path())
        .field(cookie)
        .field(view.host.display_group.as_deref().unwrap_or(""))
        .field(view.host.class.as_deref().unwrap_or(""))
        .field(view.host.groups.join(","))
        .field(r.modifier_summary())
        .body(r.message.as_str());
    Posting::to(ChannelKind::Page, envelope)
}

pub(crate) fn enadis(view: &RecordView<'_>) -> Posting {
    let r = view.record;
    let envelope = view
        .envelope("enadis")
        .field(&view.host.name)
        .field(view.test)
        .field(r.enable_time())
        .field(nlencode(r.disable_message()));
    Posting::to(ChannelKind::Enadis, envelope)
}

pub(crate) fn ack(view: &RecordView<'_>) -> Posting {
    let r = view.record;
    let envelope = view
        .envelope("ack")
        .field(&view.host.name)
        .field(view.test)
        .field(view.host.ip_string())
        .field(r.ack_time())
        .body(r.ack_message());
    Posting::to(ChannelKind::Page, envelope)
}

pub(crate) fn notify(host: &HostMeta, test: &str, sender: &str, message: &str) -> Posting {
    let envelope = Envelope::new("notify", host.name.as_str(), sender)
        .field(&host.name)
        .field(test)
        .field(host.page_path())
        .body(message);
    Posting::to(ChannelKind::Page, envelope)
}

pub(crate) fn data(host: &HostMeta, name: &str, sender: &str, body: &str) -> Posting {
    let envelope = Envelope::new("data", host.name.as_str(), sender)
        .field(&host.name)
        .field(name)
        .body(body);
    Posting::to(ChannelKind::Data, envelope)
}

pub(crate) fn drop_host(host: &str, sender: &str) -> Posting {
    Posting::to_all(Envelope::new("drophost", host, sender).field(host))
}

pub(crate) fn drop_test(host: &str, test: &str, sender: &str) -> Posting {
    Posting::to_all(Envelope::new("droptest", host, sender).field(host).field(test))
}

pub(crate) fn rename_host(host: &str, new_name: &str, sender: &str) -> Posting {
    Posting::to_all(
        Envelope::new("renamehost", host, sender)
            .field(host)
            .field(new_name),
    )
}

pub(crate) fn rename_test(host: &str, test: &str, new_name: &str, sender: &str) -> Posting {
    Posting::to_all(
        Envelope::new("renametest", host, sender)
            .field(host)
            .field(test)
            .field(new_name),
    )
}
