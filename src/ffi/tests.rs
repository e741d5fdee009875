use super::*;
use crate::forwarding::ForwardingType;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[test]
fn copy_string_reports_capacity_before_writing() {
    let mut buffer = [0x7f as c_char; 8];
    assert_eq!(unsafe { copy_string("hello", ptr::null_mut(), 0) }, 6);
    assert_eq!(unsafe { copy_string("hello", buffer.as_mut_ptr(), 0) }, 6);
    assert_eq!(unsafe { copy_string("hello", buffer.as_mut_ptr(), 5) }, 6);
    assert_eq!(buffer[0], 0x7f as c_char, "short buffer must stay untouched");
    assert_eq!(unsafe { copy_string("hello", buffer.as_mut_ptr(), 6) }, 6);
    let written = unsafe { CStr::from_ptr(buffer.as_ptr()) };
    assert_eq!(written.to_str().unwrap(), "hello");
    assert_eq!(unsafe { copy_string("", buffer.as_mut_ptr(), 1) }, 1);
    assert_eq!(buffer[0], 0);
}

#[test]
fn c_string_strips_interior_nuls() {
    assert_eq!(c_string("a\0b").to_str().unwrap(), "ab");
    assert_eq!(c_string("plain").to_str().unwrap(), "plain");
}

#[test]
fn read_str_rejects_null_and_bad_utf8() {
    let error = unsafe { read_str(ptr::null(), "token") }.unwrap_err();
    assert_eq!(error.kind_name(), "ValidationError");
    let bad = [0xffu8 as c_char, 0];
    assert!(unsafe { read_str(bad.as_ptr(), "token") }.is_err());
    assert_eq!(unsafe { read_optional_str(ptr::null(), "sni") }.unwrap(), "");
    let good = c_string("abc");
    assert_eq!(unsafe { read_str(good.as_ptr(), "token") }.unwrap(), "abc");
}

#[test]
fn string_list_exposes_null_for_empty() {
    let empty = CStringList::new(&[]);
    assert!(empty.as_ptr().is_null());
    assert_eq!(empty.len(), 0);
    let list = CStringList::new(&["a".to_string(), "bc".to_string()]);
    assert_eq!(list.len(), 2);
    let second = unsafe { CStr::from_ptr(*list.as_ptr().add(1)) };
    assert_eq!(second.to_str().unwrap(), "bc");
}

static URLS_SEEN: Mutex<Vec<String>> = Mutex::new(Vec::new());
static FAILED_SEEN: Mutex<Vec<(String, String)>> = Mutex::new(Vec::new());

unsafe extern "C" fn on_established(
    context: *mut c_void,
    tunnel: u32,
    urls: *const *const c_char,
    url_count: usize,
) {
    assert_eq!(tunnel, 9);
    assert_eq!(context as usize, 0x1234);
    let urls = unsafe { std::slice::from_raw_parts(urls, url_count) };
    let mut seen = URLS_SEEN.lock().unwrap();
    for url in urls {
        seen.push(unsafe { CStr::from_ptr(*url) }.to_string_lossy().into_owned());
    }
}

unsafe extern "C" fn on_forwarding_failed(
    _context: *mut c_void,
    _tunnel: u32,
    _binding_url: *const c_char,
    forward_to: *const c_char,
    forwarding_type: *const c_char,
    _error: *const c_char,
) {
    let forward_to = unsafe { CStr::from_ptr(forward_to) }.to_string_lossy().into_owned();
    let kind = unsafe { CStr::from_ptr(forwarding_type) }
        .to_string_lossy()
        .into_owned();
    FAILED_SEEN.lock().unwrap().push((forward_to, kind));
}

static RELEASES: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn count_release(_context: *mut c_void) {
    RELEASES.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn foreign_sink_marshals_lists_and_strings() {
    let sink = ForeignSink::new(
        ForeignCallback::Established(on_established),
        0x1234 as *mut c_void,
        None,
    );
    sink.deliver(
        9,
        &TunnelEvent::Established {
            urls: vec!["http://a.example".into(), "https://a.example".into()],
        },
    );
    assert_eq!(
        URLS_SEEN.lock().unwrap().as_slice(),
        &["http://a.example".to_string(), "https://a.example".to_string()]
    );

    let sink = ForeignSink::new(
        ForeignCallback::AdditionalForwardingFailed(on_forwarding_failed),
        ptr::null_mut(),
        None,
    );
    sink.deliver(
        1,
        &TunnelEvent::AdditionalForwardingFailed {
            binding_url: String::new(),
            forward_to: "localhost:22".into(),
            forwarding_type: ForwardingType::Tcp,
            error: "denied".into(),
        },
    );
    assert_eq!(
        FAILED_SEEN.lock().unwrap().as_slice(),
        &[("localhost:22".to_string(), "tcp".to_string())]
    );
}

#[test]
fn release_runs_once_on_drop() {
    let before = RELEASES.load(Ordering::SeqCst);
    let sink = ForeignSink::new(
        ForeignCallback::Established(on_established),
        ptr::null_mut(),
        Some(count_release),
    );
    // A mismatched event is logged and ignored.
    sink.deliver(9, &TunnelEvent::ReconnectionFailed { retry_count: 1 });
    drop(sink);
    assert_eq!(RELEASES.load(Ordering::SeqCst), before + 1);
}
