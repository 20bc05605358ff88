use std::io::Write;

use crate::client::{ScanClient, MIN_BUFSPACE};
use crate::host::{CacheHost, CrawlItem, ItemFlags};

/// Append one metadata record for a live entry, or silently skip entries that
/// expired, were flushed, or whose external payload no longer validates.
/// Times are printed as absolute epoch seconds; a zero exptime prints `-1`.
pub(crate) fn eval<H: CacheHost>(client: &mut ScanClient, host: &H, item: &H::Item) {
    let now = host.current_time();
    let flags = item.flags();
    let is_flushed = host.item_is_flushed(item);
    let is_valid = if flags.contains(ItemFlags::HDR) {
        host.storage_validate_item(item)
    } else {
        true
    };
    let exptime = item.exptime();
    if (exptime != 0 && exptime < now) || is_flushed || !is_valid {
        host.refcount_decr(item);
        return;
    }

    let key = item.key();
    // worst-case escaping triples the key; it must leave room for the rest
    // of the record
    debug_assert!(key.len() * 3 < MIN_BUFSPACE / 2);

    let started = host.process_started();
    let exp = if exptime == 0 {
        -1
    } else {
        i64::from(exptime) + started
    };
    let la = i64::from(item.last_access()) + started;
    let fetch = if flags.contains(ItemFlags::FETCHED) {
        "yes"
    } else {
        "no"
    };

    let before = client.buf_len();
    let buf = client.buf_mut();
    let _ = write!(
        buf,
        "key={} exp={} la={} cas={} fetch={} cls={} size={} flags={}",
        urlencoding::encode_binary(key),
        exp,
        la,
        item.cas(),
        fetch,
        item.class_id(),
        item.total_size(),
        item.client_flags(),
    );
    if let Some(hdr) = item.ext_header() {
        let _ = write!(buf, " ext_page={} ext_offset={}", hdr.page_id, hdr.offset);
    }
    buf.push(b'\n');
    debug_assert!(client.buf_len() - before < MIN_BUFSPACE - 1);

    host.refcount_decr(item);
}
