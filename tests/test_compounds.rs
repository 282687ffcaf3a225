use gibind::interop::{to_native, to_script, NativeArg, Variant, VariantTag};
use gibind::{
    BindConfig, CallFrame, Compound, CompoundCategory, CompoundInfo, HostType, LifeState, Posture, Registry,
    SimpleTypeSystem, Transfer, TypeDescriptor, UnwrapFlags, Value,
};
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const WIDGET: HostType = HostType(1);
const BUTTON: HostType = HostType(2);
const FILE_STREAM: HostType = HostType(3);

/// Native object: reference count plus a label set at construction
#[repr(C)]
struct Object {
    refs: AtomicUsize,
    label: Mutex<String>,
    size: AtomicUsize,
}

static FINALIZED: Mutex<Vec<usize>> = parking_lot::const_mutex(Vec::new());

fn finalized(address: usize) -> usize {
    FINALIZED.lock().iter().filter(|a| **a == address).count()
}

unsafe extern "C" fn object_ref(ptr: *mut c_void) -> *mut c_void {
    (*(ptr as *const Object)).refs.fetch_add(1, Ordering::SeqCst);
    ptr
}

unsafe extern "C" fn object_unref(ptr: *mut c_void) {
    if (*(ptr as *const Object)).refs.fetch_sub(1, Ordering::SeqCst) == 1 {
        FINALIZED.lock().push(ptr as usize);
        drop(Box::from_raw(ptr as *mut Object));
    }
}

fn new_object() -> usize {
    Box::into_raw(Box::new(Object {
        refs: AtomicUsize::new(1),
        label: Mutex::new(String::new()),
        size: AtomicUsize::new(0),
    })) as usize
}

fn refs(address: usize) -> usize {
    unsafe { (*(address as *const Object)).refs.load(Ordering::SeqCst) }
}

unsafe extern "C" fn construct_object(
    _ty: usize,
    n: u32,
    names: *const *const c_char,
    values: *const Variant,
) -> *mut c_void {
    let address = new_object();
    let object = &*(address as *const Object);
    for i in 0..n as usize {
        let name = CStr::from_ptr(*names.add(i)).to_str().unwrap_or_default();
        let value = &*values.add(i);
        match (name, value.tag()) {
            ("label", Some(VariantTag::String)) => {
                let text = CStr::from_ptr(value.data.v_pointer as *const c_char);
                *object.label.lock() = text.to_string_lossy().into_owned();
            }
            ("size", Some(VariantTag::Int)) => {
                object.size.store(value.data.v_int64 as usize, Ordering::SeqCst);
            }
            _ => {
                object_unref(address as *mut c_void);
                return std::ptr::null_mut();
            }
        }
    }
    address as *mut c_void
}

static RECORD_FREES: Mutex<Vec<usize>> = parking_lot::const_mutex(Vec::new());

unsafe extern "C" fn record_free(ptr: *mut c_void) {
    RECORD_FREES.lock().push(ptr as usize);
    libc::free(ptr);
}

fn record_frees(address: usize) -> usize {
    RECORD_FREES.lock().iter().filter(|a| **a == address).count()
}

fn registry() -> Registry {
    let types = SimpleTypeSystem::new();
    types.register(WIDGET, "Gtk.Widget", None);
    types.register(BUTTON, "Gtk.Button", Some(WIDGET));
    types.register(FILE_STREAM, "Gio.FileStream", None);
    Registry::new(BindConfig::default(), Arc::new(types))
}

fn object_info(namespace: &str, name: &str, ty: HostType) -> Arc<CompoundInfo> {
    Arc::new(
        CompoundInfo::new(namespace, name, ty, CompoundCategory::Object)
            .with_refcounting(object_ref, object_unref)
            .with_constructor(construct_object)
            .with_property("label", TypeDescriptor::utf8())
            .with_property("size", TypeDescriptor::int32()),
    )
}

#[test]
fn test_identity_is_unique_per_address() {
    let reg = registry();
    let button = object_info("Gtk", "Button", BUTTON);
    let address = new_object();

    let first = Compound::wrap(&reg, &button, address, Posture::Own, None).unwrap();
    let again = Compound::wrap(&reg, &button, address, Posture::Peek, None).unwrap();
    assert!(first.ptr_eq(&again));

    // A supertype request reuses the same wrapper
    let widget = object_info("Gtk", "Widget", WIDGET);
    let as_widget = Compound::wrap(&reg, &widget, address, Posture::Peek, None).unwrap();
    assert!(as_widget.ptr_eq(&first));
    assert_eq!(reg.cache().len(), 1);
}

#[test]
fn test_identity_ends_with_last_handle() {
    let reg = registry();
    let button = object_info("Gtk", "Button", BUTTON);
    let address = new_object();
    let before = finalized(address);
    unsafe { object_ref(address as *mut c_void) };

    let first = Compound::wrap(&reg, &button, address, Posture::Own, None).unwrap();
    drop(first);
    assert!(reg.cache().is_empty());
    assert_eq!(refs(address), 1);

    let second = Compound::wrap(&reg, &button, address, Posture::Own, None).unwrap();
    assert!(second.is_cached());
    drop(second);
    assert_eq!(finalized(address), before + 1);
}

#[test]
fn test_release_many_times_destroys_once() {
    let reg = registry();
    let button = object_info("Gtk", "Button", BUTTON);
    let address = new_object();
    let before = finalized(address);
    let wrapper = Compound::wrap(&reg, &button, address, Posture::Own, None).unwrap();
    let clone = wrapper.clone();

    assert!(wrapper.release());
    for _ in 0..4 {
        assert!(!wrapper.release());
        assert!(!clone.release());
    }
    assert_eq!(clone.life(), LifeState::Released);
    drop(wrapper);
    drop(clone);
    assert_eq!(finalized(address), before + 1);
}

#[test]
fn test_unrelated_type_rejected_without_native_access() {
    let reg = registry();
    let button = object_info("Gtk", "Button", BUTTON);
    let stream = object_info("Gio", "FileStream", FILE_STREAM);
    let address = new_object();
    let value = Value::Compound(Compound::wrap(&reg, &button, address, Posture::Own, None).unwrap());

    let err = Compound::unwrap(&reg, &value, &stream, UnwrapFlags::empty()).unwrap_err();
    assert!(err.is_type_error());
    assert!(err.to_string().contains("FileStream"));
    assert_eq!(refs(address), 1);
}

#[test]
fn test_cache_hit_with_unrelated_type_gets_fresh_wrapper() {
    let reg = registry();
    let button = object_info("Gtk", "Button", BUTTON);
    let stream = object_info("Gio", "FileStream", FILE_STREAM);
    let address = new_object();
    let before = finalized(address);
    unsafe { object_ref(address as *mut c_void) };

    let as_button = Compound::wrap(&reg, &button, address, Posture::Own, None).unwrap();
    let as_stream = Compound::wrap(&reg, &stream, address, Posture::Own, None).unwrap();
    assert!(!as_button.ptr_eq(&as_stream));
    assert!(!as_stream.is_cached());
    drop(as_stream);
    drop(as_button);
    assert_eq!(finalized(address), before + 1);
}

#[test]
fn test_borrowed_object_is_referenced() {
    let reg = registry();
    let button = object_info("Gtk", "Button", BUTTON);
    let ty = TypeDescriptor::compound(button);
    let address = new_object();
    let before = finalized(address);

    let value = to_script(&reg, &ty, Transfer::None, NativeArg::from_address(address), None).unwrap();
    assert_eq!(refs(address), 2);
    drop(value);
    assert_eq!(refs(address), 1);

    let owned = to_script(&reg, &ty, Transfer::Everything, NativeArg::from_address(address), None).unwrap();
    assert_eq!(refs(address), 1);
    drop(owned);
    assert_eq!(finalized(address), before + 1);
}

#[test]
fn test_construct_object_from_properties() {
    let reg = registry();
    let button = object_info("Gtk", "Button", BUTTON);
    let props = Value::record([("label", Value::string("OK")), ("size", Value::Int(12))]);

    let wrapper = Compound::construct(&reg, &button, &props).unwrap();
    assert_eq!(wrapper.posture(), Posture::Own);
    let address = wrapper.address().unwrap();
    let object = unsafe { &*(address as *const Object) };
    assert_eq!(object.label.lock().as_str(), "OK");
    assert_eq!(object.size.load(Ordering::SeqCst), 12);
    assert_eq!(refs(address), 1);
}

#[test]
fn test_construct_rejects_unknown_property() {
    let reg = registry();
    let button = object_info("Gtk", "Button", BUTTON);
    let err = Compound::construct(&reg, &button, &Value::record([("colour", Value::Int(1))])).unwrap_err();
    assert!(err.is_type_error());

    let err = Compound::construct(&reg, &button, &Value::record([("size", Value::string("big"))])).unwrap_err();
    assert!(err.is_type_error());
}

#[test]
fn test_construct_without_protocol_is_unsupported() {
    let reg = registry();
    let plain = Arc::new(CompoundInfo::new("Gtk", "Plain", WIDGET, CompoundCategory::Object));
    let err = Compound::construct(&reg, &plain, &Value::Nil).unwrap_err();
    assert!(matches!(err.kind(), gibind::ErrorKind::UnsupportedKind(_)));
}

#[test]
fn test_shutdown_uncaches_live_wrappers() {
    let reg = registry();
    let button = object_info("Gtk", "Button", BUTTON);
    let address = new_object();
    let before = finalized(address);
    let wrapper = Compound::wrap(&reg, &button, address, Posture::Own, None).unwrap();

    reg.shutdown();
    assert!(reg.cache().is_empty());
    assert!(wrapper.is_live());
    drop(wrapper);
    assert_eq!(finalized(address), before + 1);
}

#[test]
fn test_owned_record_round_trip_frees_once() {
    let reg = registry();
    let info = Arc::new(
        CompoundInfo::new("Gio", "Span", HostType::INVALID, CompoundCategory::Struct)
            .with_layout(8, 4)
            .with_free(record_free),
    );
    let ty = TypeDescriptor::compound(info);
    let address = unsafe { libc::calloc(1, 8) } as usize;

    let value = to_script(&reg, &ty, Transfer::Everything, NativeArg::from_address(address), None).unwrap();
    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::Everything, &value, None, &mut slot).unwrap();
    assert_eq!(slot.pointer() as usize, address);
    frame.commit();
    drop(frame);
    drop(value);
    assert_eq!(record_frees(address), 0);

    // Native side owns the record again and releases it
    unsafe { record_free(address as *mut c_void) };
    assert_eq!(record_frees(address), 1);
}

#[test]
fn test_owned_object_round_trip_finalizes_once() {
    let reg = registry();
    let ty = TypeDescriptor::compound(object_info("Gtk", "Button", BUTTON));
    let address = new_object();
    let before = finalized(address);

    let value = to_script(&reg, &ty, Transfer::Everything, NativeArg::from_address(address), None).unwrap();
    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::Everything, &value, None, &mut slot).unwrap();
    frame.commit();
    drop(frame);
    drop(value);
    assert_eq!(refs(address), 1);
    assert_eq!(finalized(address), before);

    unsafe { object_unref(address as *mut c_void) };
    assert_eq!(finalized(address), before + 1);
}
