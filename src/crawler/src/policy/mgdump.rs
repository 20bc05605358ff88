use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::client::ScanClient;
use crate::host::{CacheHost, CrawlItem, ItemFlags};

/// Append one `mg` line per live entry. Binary keys are base64-armored and
/// tagged with `b` so the output stays a valid command stream.
pub(crate) fn eval<H: CacheHost>(client: &mut ScanClient, host: &H, item: &H::Item) {
    let now = host.current_time();
    let exptime = item.exptime();
    if (exptime != 0 && exptime < now) || host.item_is_flushed(item) {
        host.refcount_decr(item);
        return;
    }

    client.append(b"mg ");
    if item.flags().contains(ItemFlags::KEY_BINARY) {
        client.append(STANDARD.encode(item.key()).as_bytes());
        client.append(b" b\r\n");
    } else {
        client.append(item.key());
        client.append(b"\r\n");
    }

    host.refcount_decr(item);
}
