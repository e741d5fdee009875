use super::*;
use std::ffi::CString;
use std::ptr;

#[test]
fn version_follows_two_phase_copy() {
    let needed = unsafe { TunnelBridgeVersion(ptr::null_mut(), 0) };
    assert_eq!(needed, BRIDGE_VERSION.len() as i64 + 1);
    let mut buffer = vec![0 as c_char; needed as usize];
    assert_eq!(
        unsafe { TunnelBridgeVersion(buffer.as_mut_ptr(), buffer.len()) },
        needed
    );
    let version = unsafe { CStr::from_ptr(buffer.as_ptr()) };
    assert_eq!(version.to_str().unwrap(), BRIDGE_VERSION);
}

#[test]
fn environment_is_frozen_after_first_object() {
    let config = crate::abi::config::TunnelConfigNew();
    assert_ne!(config, 0);
    assert!(TunnelEnvironmentInit());

    assert!(!TunnelSetDebug(true));
    assert!(!TunnelSetLogEnable(false));
    let path = CString::new("/tmp/tunnel-bridge-test.log").unwrap();
    assert!(!unsafe { TunnelSetLogPath(path.as_ptr()) });

    let mut kind = [0 as c_char; 32];
    let mut message = [0 as c_char; 128];
    assert!(unsafe {
        TunnelTakeLastException(
            kind.as_mut_ptr(),
            kind.len(),
            message.as_mut_ptr(),
            message.len(),
            ptr::null_mut(),
            ptr::null_mut(),
        )
    });
    let kind = unsafe { CStr::from_ptr(kind.as_ptr()) };
    assert_eq!(kind.to_str().unwrap(), "InvalidStateError");
    assert!(crate::abi::config::TunnelConfigFree(config));
}

#[test]
fn take_last_exception_without_one_reports_nothing() {
    let _ = error::take_last_exception();
    let mut kind_required = 99usize;
    let taken = unsafe {
        TunnelTakeLastException(
            ptr::null_mut(),
            0,
            ptr::null_mut(),
            0,
            &mut kind_required,
            ptr::null_mut(),
        )
    };
    assert!(!taken);
    assert!(!TunnelHasLastException());
    assert_eq!(kind_required, 99);
}

#[test]
fn null_sink_restores_default_logging() {
    assert!(unsafe { TunnelSetLogSink(ptr::null(), ptr::null(), ptr::null_mut()) });
}
