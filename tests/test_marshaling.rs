use gibind::descriptor::{FieldInfo, ListLinks};
use gibind::interop::{to_native, to_script, CallFrame, NativeArg};
use gibind::{
    CompoundCategory, CompoundInfo, HostType, Posture, Primitive, Registry, Transfer,
    TypeDescriptor, Value,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::ffi::c_void;
use std::sync::Arc;

#[repr(C)]
struct Point {
    x: i32,
    y: i32,
}

static FREED: Mutex<Vec<usize>> = parking_lot::const_mutex(Vec::new());

fn times_freed(address: usize) -> usize {
    FREED.lock().iter().filter(|a| **a == address).count()
}

unsafe extern "C" fn point_free(ptr: *mut c_void) {
    FREED.lock().push(ptr as usize);
    libc::free(ptr);
}

fn point_info() -> Arc<CompoundInfo> {
    Arc::new(
        CompoundInfo::new("Test", "Point", HostType(10), CompoundCategory::Struct)
            .with_layout(std::mem::size_of::<Point>(), 4)
            .with_field(FieldInfo::new("x", 0, TypeDescriptor::int32()))
            .with_field(FieldInfo::new("y", 4, TypeDescriptor::int32()))
            .with_free(point_free),
    )
}

fn native_point(x: i32, y: i32) -> usize {
    unsafe {
        let p = libc::malloc(std::mem::size_of::<Point>()) as *mut Point;
        p.write(Point { x, y });
        p as usize
    }
}

fn convert(reg: &Registry, ty: &TypeDescriptor, value: &Value) -> gibind::Result<Value> {
    let mut frame = CallFrame::new(reg);
    let mut slot = NativeArg::zeroed();
    to_native(reg, &mut frame, ty, Transfer::None, value, None, &mut slot)?;
    to_script(reg, ty, Transfer::None, slot, None)
}

#[test]
fn test_everything_round_trip_frees_once() {
    let reg = Registry::with_defaults();
    let info = point_info();
    let ty = TypeDescriptor::compound(info.clone());
    let address = native_point(3, 4);
    let before = times_freed(address);

    // Out: native code hands its instance over
    let value = to_script(&reg, &ty, Transfer::Everything, NativeArg::from_address(address), None).unwrap();
    let Value::Compound(wrapper) = &value else {
        panic!("record did not produce a compound");
    };
    assert_eq!(wrapper.posture(), Posture::Own);
    assert_eq!(wrapper.field(&reg, "x").unwrap(), Value::Int(3));

    // In: the instance goes back to native code
    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::Everything, &value, None, &mut slot).unwrap();
    assert_eq!(slot.address(), address);
    frame.commit();
    drop(frame);
    assert_eq!(wrapper.posture(), Posture::Peek);

    // Native code is now the only owner and releases the instance itself
    let back = unsafe { &*(slot.address() as *const Point) };
    assert_eq!((back.x, back.y), (3, 4));
    drop(value);
    assert_eq!(times_freed(address), before);
    unsafe { point_free(address as *mut c_void) };
    assert_eq!(times_freed(address), before + 1);
}

#[test]
fn test_failed_transfer_keeps_ownership() {
    let reg = Registry::with_defaults();
    let info = point_info();
    let ty = TypeDescriptor::compound(info);
    let address = native_point(1, 2);
    let before = times_freed(address);
    let value = to_script(&reg, &ty, Transfer::Everything, NativeArg::from_address(address), None).unwrap();

    // The call never happens: the frame is dropped uncommitted
    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::Everything, &value, None, &mut slot).unwrap();
    drop(frame);

    let Value::Compound(wrapper) = &value else {
        panic!("record did not produce a compound");
    };
    assert_eq!(wrapper.posture(), Posture::Own);
    drop(value);
    assert_eq!(times_freed(address), before + 1);
}

#[test]
fn test_record_initializer_builds_struct() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::compound(point_info());
    let init = Value::record([("x", Value::Int(7)), ("y", Value::Int(-1))]);

    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::None, &init, None, &mut slot).unwrap();
    let p = unsafe { &*(slot.address() as *const Point) };
    assert_eq!((p.x, p.y), (7, -1));
}

#[test]
fn test_wrong_value_kind_for_record() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::compound(point_info());
    let err = convert(&reg, &ty, &Value::string("point")).unwrap_err();
    assert!(err.is_type_error());
}

#[test]
fn test_array_of_embedded_records() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::array_fixed(TypeDescriptor::embedded(point_info()), 2);
    let value = Value::Array(vec![
        Value::record([("x", Value::Int(1)), ("y", Value::Int(2))]),
        Value::record([("x", Value::Int(3)), ("y", Value::Int(4))]),
    ]);

    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::None, &value, None, &mut slot).unwrap();
    let points = unsafe { std::slice::from_raw_parts(slot.address() as *const Point, 2) };
    assert_eq!((points[1].x, points[1].y), (3, 4));

    let Value::Array(items) = to_script(&reg, &ty, Transfer::None, slot, None).unwrap() else {
        panic!("array did not produce an array");
    };
    let Value::Compound(second) = &items[1] else {
        panic!("element is not a compound");
    };
    // Copies survive the array storage
    assert_eq!(second.posture(), Posture::Allocate);
    drop(frame);
    assert_eq!(second.field(&reg, "y").unwrap(), Value::Int(4));
}

#[test]
fn test_pointer_list_of_records() {
    let reg = Registry::with_defaults();
    let info = point_info();
    let ty = TypeDescriptor::list(TypeDescriptor::compound(info.clone()), ListLinks::Double);
    let a = gibind::Compound::construct(&reg, &info, &Value::record([("x", Value::Int(5))])).unwrap();
    let b = gibind::Compound::construct(&reg, &info, &Value::record([("y", Value::Int(6))])).unwrap();
    let value = Value::Array(vec![Value::Compound(a.clone()), Value::Compound(b.clone())]);

    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::None, &value, None, &mut slot).unwrap();
    let back = to_script(&reg, &ty, Transfer::None, slot, None).unwrap();
    // Borrowed records resolve to the live wrappers
    assert_eq!(back, value);
}

proptest! {
    #[test]
    fn int32_accepts_exactly_its_range(n in any::<i64>()) {
        let reg = Registry::with_defaults();
        let result = convert(&reg, &TypeDescriptor::int32(), &Value::Int(n));
        if i32::try_from(n).is_ok() {
            prop_assert_eq!(result.unwrap(), Value::Int(n));
        } else {
            prop_assert!(result.unwrap_err().is_range_error());
        }
    }

    #[test]
    fn uint8_accepts_exactly_its_range(n in -1000i64..1000) {
        let reg = Registry::with_defaults();
        let result = convert(&reg, &TypeDescriptor::uint8(), &Value::Int(n));
        if (0..=255).contains(&n) {
            prop_assert_eq!(result.unwrap(), Value::Int(n));
        } else {
            prop_assert!(result.unwrap_err().is_range_error());
        }
    }

    #[test]
    fn uint32_rejects_negatives(n in i64::MIN..0) {
        let reg = Registry::with_defaults();
        let ty = TypeDescriptor::primitive(Primitive::UInt32);
        prop_assert!(convert(&reg, &ty, &Value::Int(n)).unwrap_err().is_range_error());
    }

    #[test]
    fn doubles_round_trip(f in any::<f64>().prop_filter("comparable", |f| !f.is_nan())) {
        let reg = Registry::with_defaults();
        prop_assert_eq!(convert(&reg, &TypeDescriptor::double(), &Value::Float(f)).unwrap(), Value::Float(f));
    }

    #[test]
    fn strings_round_trip(s in "\\PC{0,32}") {
        let reg = Registry::with_defaults();
        let value = Value::string(&s);
        prop_assert_eq!(convert(&reg, &TypeDescriptor::utf8(), &value).unwrap(), value);
    }
}
