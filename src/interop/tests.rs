use super::abi::{narrow_return, native_size, storage, widen_return, Storage};
use super::containers::{array_to_native, array_to_script, script_len};
use super::*;
use crate::config::BindConfig;
use crate::descriptor::{
    CompoundCategory, CompoundInfo, EnumInfo, HostType, ListLinks, Primitive, SimpleTypeSystem,
    Transfer, TypeDescriptor,
};
use crate::lifetime::Registry;
use crate::value::{ScriptFunction, Value};
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;

fn out(reg: &Registry, ty: &TypeDescriptor, value: &Value) -> crate::Result<NativeArg> {
    let mut frame = CallFrame::new(reg);
    let mut slot = NativeArg::zeroed();
    to_native(reg, &mut frame, ty, Transfer::None, value, None, &mut slot)?;
    Ok(slot)
}

fn round_trip(reg: &Registry, ty: &TypeDescriptor, value: &Value) -> crate::Result<Value> {
    let slot = out(reg, ty, value)?;
    to_script(reg, ty, Transfer::None, slot, None)
}

fn colors() -> Arc<EnumInfo> {
    Arc::new(
        EnumInfo::new("Test", "Color", false)
            .with_value("red", 0)
            .with_value("green", 1)
            .with_value("blue", 2),
    )
}

fn modes() -> Arc<EnumInfo> {
    Arc::new(
        EnumInfo::new("Test", "Mode", true)
            .with_value("read", 1)
            .with_value("write", 2)
            .with_value("exec", 4),
    )
}

static FREED: Mutex<Vec<usize>> = parking_lot::const_mutex(Vec::new());

unsafe extern "C" fn free_recorded(ptr: *mut c_void) {
    FREED.lock().push(ptr as usize);
    libc::free(ptr);
}

#[test]
fn test_integer_round_trips() {
    let reg = Registry::with_defaults();
    assert_eq!(round_trip(&reg, &TypeDescriptor::int32(), &Value::Int(-5)).unwrap(), Value::Int(-5));
    assert_eq!(round_trip(&reg, &TypeDescriptor::uint8(), &Value::Int(255)).unwrap(), Value::Int(255));
    assert_eq!(
        round_trip(&reg, &TypeDescriptor::int64(), &Value::Int(i64::MIN)).unwrap(),
        Value::Int(i64::MIN)
    );
    assert_eq!(
        round_trip(&reg, &TypeDescriptor::primitive(Primitive::Int16), &Value::Int(-32768)).unwrap(),
        Value::Int(-32768)
    );
}

#[test]
fn test_integer_range_errors() {
    let reg = Registry::with_defaults();
    assert!(out(&reg, &TypeDescriptor::uint8(), &Value::Int(256)).unwrap_err().is_range_error());
    assert!(out(&reg, &TypeDescriptor::uint8(), &Value::Int(-1)).unwrap_err().is_range_error());
    assert!(out(&reg, &TypeDescriptor::primitive(Primitive::UInt64), &Value::Int(-1))
        .unwrap_err()
        .is_range_error());
    assert!(out(&reg, &TypeDescriptor::int32(), &Value::string("1")).unwrap_err().is_type_error());
}

#[test]
fn test_large_unsigned_becomes_float() {
    let reg = Registry::with_defaults();
    let mut slot = NativeArg::zeroed();
    slot.v_uint64 = u64::MAX;
    let value = to_script(&reg, &TypeDescriptor::primitive(Primitive::UInt64), Transfer::None, slot, None).unwrap();
    assert_eq!(value, Value::Float(u64::MAX as f64));
}

#[test]
fn test_float_to_int_follows_config() {
    let strict = Registry::with_defaults();
    assert!(out(&strict, &TypeDescriptor::int32(), &Value::Float(3.0)).unwrap_err().is_type_error());

    let mut config = BindConfig::default();
    config.marshal.allow_float_to_int = true;
    let lenient = Registry::new(config, Arc::new(SimpleTypeSystem::new()));
    assert_eq!(
        round_trip(&lenient, &TypeDescriptor::int32(), &Value::Float(3.0)).unwrap(),
        Value::Int(3)
    );
    assert!(out(&lenient, &TypeDescriptor::int32(), &Value::Float(3.5)).unwrap_err().is_type_error());
}

#[test]
fn test_booleans_are_strict() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::boolean();
    assert_eq!(round_trip(&reg, &ty, &Value::Bool(true)).unwrap(), Value::Bool(true));
    assert_eq!(round_trip(&reg, &ty, &Value::Nil).unwrap(), Value::Bool(false));
    assert!(out(&reg, &ty, &Value::Int(1)).unwrap_err().is_type_error());
}

#[test]
fn test_floats() {
    let reg = Registry::with_defaults();
    let float = TypeDescriptor::primitive(Primitive::Float);
    assert_eq!(round_trip(&reg, &float, &Value::Float(0.5)).unwrap(), Value::Float(0.5));
    assert!(out(&reg, &float, &Value::Float(1e300)).unwrap_err().is_range_error());
    assert_eq!(
        round_trip(&reg, &TypeDescriptor::double(), &Value::Int(2)).unwrap(),
        Value::Float(2.0)
    );
}

#[test]
fn test_unichar() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::primitive(Primitive::Unichar);
    assert_eq!(round_trip(&reg, &ty, &Value::string("é")).unwrap(), Value::string("é"));
    assert_eq!(round_trip(&reg, &ty, &Value::Int(65)).unwrap(), Value::string("A"));
    assert!(out(&reg, &ty, &Value::string("ab")).unwrap_err().is_type_error());
    assert!(out(&reg, &ty, &Value::Int(0xD800)).unwrap_err().is_range_error());
}

#[test]
fn test_borrowed_string_lives_with_frame() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::utf8();
    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::None, &Value::string("borrowed"), None, &mut slot).unwrap();
    assert_eq!(frame.len(), 1);

    let text = unsafe { CStr::from_ptr(slot.pointer() as *const c_char) };
    assert_eq!(text.to_str().unwrap(), "borrowed");
    assert_eq!(to_script(&reg, &ty, Transfer::None, slot, None).unwrap(), Value::string("borrowed"));
}

#[test]
fn test_transferred_string_round_trip() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::utf8();
    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::Everything, &Value::string("owned"), None, &mut slot)
        .unwrap();
    frame.commit();
    drop(frame);

    // Native side now owns the copy; taking it back frees it
    let value = to_script(&reg, &ty, Transfer::Everything, slot, None).unwrap();
    assert_eq!(value, Value::string("owned"));
}

#[test]
fn test_string_errors() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::utf8();
    assert!(out(&reg, &ty, &Value::string("a\0b")).unwrap_err().is_type_error());
    assert!(out(&reg, &ty, &Value::Int(1)).unwrap_err().is_type_error());
    assert_eq!(round_trip(&reg, &ty, &Value::Nil).unwrap(), Value::Nil);

    let invalid = b"\xff\xfe\0";
    let slot = NativeArg::from_pointer(invalid.as_ptr() as *mut c_void);
    assert!(to_script(&reg, &ty, Transfer::None, slot, None).unwrap_err().is_type_error());
    let lossy = to_script(&reg, &TypeDescriptor::filename(), Transfer::None, slot, None).unwrap();
    assert!(matches!(lossy, Value::Str(_)));
}

#[test]
fn test_non_nullable_pointer_rejects_nil() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::utf8();
    let arg = crate::descriptor::ArgInfo::input("name", ty.clone());
    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    let err = to_native(&reg, &mut frame, &ty, Transfer::None, &Value::Nil, Some(&arg), &mut slot).unwrap_err();
    assert!(err.is_null_error());

    let nullable = arg.nullable();
    to_native(&reg, &mut frame, &ty, Transfer::None, &Value::Nil, Some(&nullable), &mut slot).unwrap();
    assert!(slot.pointer().is_null());
}

#[test]
fn test_enum_names_and_numbers() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::enumeration(colors());
    assert_eq!(round_trip(&reg, &ty, &Value::string("blue")).unwrap(), Value::Int(2));
    assert_eq!(round_trip(&reg, &ty, &Value::string("GREEN")).unwrap(), Value::Int(1));
    assert_eq!(round_trip(&reg, &ty, &Value::Int(7)).unwrap(), Value::Int(7));
    assert!(out(&reg, &ty, &Value::string("purple")).unwrap_err().is_type_error());
    assert!(out(&reg, &ty, &Value::Int(i64::from(i32::MAX) + 1)).unwrap_err().is_range_error());
}

#[test]
fn test_flags_are_or_ed() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::enumeration(modes());
    let value = Value::Array(vec![Value::string("read"), Value::string("exec")]);
    assert_eq!(round_trip(&reg, &ty, &value).unwrap(), Value::Int(5));
    assert_eq!(round_trip(&reg, &ty, &Value::Nil).unwrap(), Value::Int(0));
    assert!(out(&reg, &ty, &Value::Int(-1)).unwrap_err().is_range_error());
}

#[test]
fn test_zero_terminated_array() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::array_zero_terminated(TypeDescriptor::int32());
    let value = Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);

    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::None, &value, None, &mut slot).unwrap();
    let raw = unsafe { std::slice::from_raw_parts(slot.pointer() as *const i32, 4) };
    assert_eq!(raw, &[1, 2, 3, 0]);

    assert_eq!(to_script(&reg, &ty, Transfer::None, slot, None).unwrap(), value);
}

#[test]
fn test_transferred_string_array() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::array_zero_terminated(TypeDescriptor::utf8());
    let value = Value::Array(vec![Value::string("a"), Value::string("bc")]);

    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::Everything, &value, None, &mut slot).unwrap();
    frame.commit();
    drop(frame);
    assert_eq!(to_script(&reg, &ty, Transfer::Everything, slot, None).unwrap(), value);
}

#[test]
fn test_fixed_array_pads_and_bounds() {
    let reg = Registry::with_defaults();
    let info = match TypeDescriptor::array_fixed(TypeDescriptor::int32(), 3).kind {
        crate::descriptor::DescriptorKind::Array(info) => info,
        _ => unreachable!(),
    };
    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    array_to_native(&reg, &mut frame, &info, Transfer::None, &Value::Array(vec![Value::Int(9)]), true, &mut slot)
        .unwrap();
    assert_eq!(
        array_to_script(&reg, &info, Transfer::None, slot, None, None).unwrap(),
        Value::Array(vec![Value::Int(9), Value::Int(0), Value::Int(0)])
    );

    let too_many = Value::Array((0..4).map(Value::Int).collect());
    let err = array_to_native(&reg, &mut frame, &info, Transfer::None, &too_many, true, &mut slot).unwrap_err();
    assert!(err.is_range_error());
}

#[test]
fn test_byte_arrays() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::array_with_length(TypeDescriptor::uint8(), 1);
    let info = ty.array_info().unwrap().clone();
    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    array_to_native(&reg, &mut frame, &info, Transfer::None, &Value::bytes(b"xyz"), true, &mut slot).unwrap();
    assert_eq!(
        array_to_script(&reg, &info, Transfer::None, slot, Some(3), None).unwrap(),
        Value::bytes(b"xyz")
    );
    assert_eq!(
        array_to_script(&reg, &info, Transfer::None, NativeArg::zeroed(), Some(0), None).unwrap(),
        Value::bytes(b"")
    );
    assert!(array_to_script(&reg, &info, Transfer::None, slot, None, None).unwrap_err().to_string().contains("length"));
}

#[test]
fn test_script_len() {
    assert_eq!(script_len(&Value::Nil), Some(0));
    assert_eq!(script_len(&Value::Array(vec![Value::Nil; 5])), Some(5));
    assert_eq!(script_len(&Value::bytes([1u8, 2])), Some(2));
    assert_eq!(script_len(&Value::Int(3)), None);
}

#[test]
fn test_list_round_trip() {
    let reg = Registry::with_defaults();
    for links in [ListLinks::Single, ListLinks::Double] {
        let ty = TypeDescriptor::list(TypeDescriptor::utf8(), links);
        let value = Value::Array(vec![Value::string("one"), Value::string("two"), Value::string("three")]);

        let mut frame = CallFrame::new(&reg);
        let mut slot = NativeArg::zeroed();
        to_native(&reg, &mut frame, &ty, Transfer::Everything, &value, None, &mut slot).unwrap();
        frame.commit();
        drop(frame);
        assert_eq!(to_script(&reg, &ty, Transfer::Everything, slot, None).unwrap(), value);
    }
}

#[test]
fn test_integer_list_payloads() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::list(TypeDescriptor::int32(), ListLinks::Single);
    let value = Value::Array(vec![Value::Int(-1), Value::Int(40)]);

    let mut frame = CallFrame::new(&reg);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::None, &value, None, &mut slot).unwrap();
    // Both nodes sit in one element group
    assert_eq!(frame.len(), 1);
    assert_eq!(to_script(&reg, &ty, Transfer::None, slot, None).unwrap(), value);

    // An empty list is the null pointer
    assert_eq!(round_trip(&reg, &ty, &Value::Array(vec![])).unwrap(), Value::Nil);
}

#[test]
fn test_frame_limit() {
    let mut frame = CallFrame::with_limit(1);
    frame.keep(Value::Int(1)).unwrap();
    assert!(frame.keep(Value::Int(2)).unwrap_err().is_range_error());
}

#[test]
fn test_container_elements_count_once_against_limit() {
    let reg = Registry::with_defaults();
    let strings = Value::Array((0..300).map(|i| Value::string(format!("item-{}", i))).collect());

    let array = TypeDescriptor::array_zero_terminated(TypeDescriptor::utf8());
    let mut frame = CallFrame::with_limit(2);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &array, Transfer::None, &strings, None, &mut slot).unwrap();
    assert_eq!(frame.len(), 2);
    assert_eq!(to_script(&reg, &array, Transfer::None, slot, None).unwrap(), strings);

    let list = TypeDescriptor::list(TypeDescriptor::utf8(), ListLinks::Double);
    let mut frame = CallFrame::with_limit(1);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &list, Transfer::None, &strings, None, &mut slot).unwrap();
    assert_eq!(frame.len(), 1);
    assert_eq!(to_script(&reg, &list, Transfer::None, slot, None).unwrap(), strings);
}

#[test]
fn test_committed_elements_stay_with_native_side() {
    let reg = Registry::with_defaults();
    let ty = TypeDescriptor::list(TypeDescriptor::int32(), ListLinks::Single);
    let value = Value::Array(vec![Value::Int(1), Value::Int(2)]);

    let mut frame = CallFrame::with_limit(1);
    let mut slot = NativeArg::zeroed();
    to_native(&reg, &mut frame, &ty, Transfer::Container, &value, None, &mut slot).unwrap();
    frame.commit();
    drop(frame);

    // Nodes survived the frame; taking the container back frees them
    assert_eq!(to_script(&reg, &ty, Transfer::Container, slot, None).unwrap(), value);
}

#[test]
fn test_uncommitted_transfer_is_freed() {
    let committed = unsafe { libc::malloc(8) } as usize;
    let abandoned = unsafe { libc::malloc(8) } as usize;

    let mut frame = CallFrame::with_limit(4);
    frame.transferred(committed, free_recorded).unwrap();
    frame.commit();
    drop(frame);

    let mut frame = CallFrame::with_limit(4);
    frame.transferred(abandoned, free_recorded).unwrap();
    drop(frame);

    let freed = FREED.lock();
    assert!(freed.contains(&abandoned));
    assert!(!freed.contains(&committed));
    drop(freed);
    unsafe { libc::free(committed as *mut c_void) };
}

#[test]
fn test_variant_inference() {
    let reg = Registry::with_defaults();
    for value in [
        Value::Nil,
        Value::Bool(true),
        Value::Int(-9),
        Value::Float(1.25),
        Value::string("text"),
        Value::Pointer(0x1000),
    ] {
        let mut variant = to_variant(&reg, None, &value).unwrap();
        assert_eq!(from_variant(&reg, &variant).unwrap(), value);
        variant.clear();
        assert_eq!(variant.tag(), Some(VariantTag::Empty));
    }
    assert!(to_variant(&reg, None, &Value::Array(vec![])).unwrap_err().is_type_error());
}

#[test]
fn test_typed_variant_checks_range() {
    let reg = Registry::with_defaults();
    let variant = to_variant(&reg, Some(&TypeDescriptor::uint8()), &Value::Int(200)).unwrap();
    assert_eq!(variant.tag(), Some(VariantTag::UInt));
    assert!(to_variant(&reg, Some(&TypeDescriptor::uint8()), &Value::Int(300))
        .unwrap_err()
        .is_range_error());

    let colored = to_variant(&reg, Some(&TypeDescriptor::enumeration(colors())), &Value::string("green")).unwrap();
    assert_eq!(from_variant(&reg, &colored).unwrap(), Value::Int(1));
}

#[test]
fn test_variant_compound_resolves_registered_type() {
    let reg = Registry::with_defaults();
    let info = Arc::new(
        CompoundInfo::new("Test", "Box", HostType(55), CompoundCategory::Struct).with_layout(8, 4),
    );
    reg.repository_mut()
        .define("Test")
        .insert("Box", crate::lifetime::RepositoryItem::Compound(info.clone()));

    let record = crate::Compound::allocate(&reg, &info).unwrap();
    let variant = to_variant(&reg, None, &Value::Compound(record.clone())).unwrap();
    assert_eq!(variant.tag(), Some(VariantTag::Compound));
    assert_eq!(variant.host_type, 55);

    // Borrowed record, no parent, no copy function: the cached wrapper comes back
    let Value::Compound(back) = from_variant(&reg, &variant).unwrap() else {
        panic!("variant did not produce a compound");
    };
    assert!(back.ptr_eq(&record));
}

#[test]
fn test_value_closure_invocation() {
    let reg = Registry::with_defaults();
    let closure = ValueClosure::new(
        &reg,
        ScriptFunction::new(|args| {
            let sum = args.iter().map(|a| match a {
                Value::Int(i) => *i,
                _ => 0,
            });
            Ok(vec![Value::Int(sum.sum())])
        }),
        Some(TypeDescriptor::int32()),
    );

    let params = [
        to_variant(&reg, None, &Value::Int(40)).unwrap(),
        to_variant(&reg, None, &Value::Int(2)).unwrap(),
    ];
    let ret = closure.invoke(&params);
    assert_eq!(ret.tag(), Some(VariantTag::Int));
    assert_eq!(from_variant(&reg, &ret).unwrap(), Value::Int(42));
}

#[test]
fn test_value_closure_error_leaves_empty_result() {
    let reg = Registry::with_defaults();
    let closure = ValueClosure::new(
        &reg,
        ScriptFunction::new(|_| Err(crate::BindError::script("handler failed"))),
        None,
    );
    let ret = closure.invoke(&[]);
    assert_eq!(ret.tag(), Some(VariantTag::Empty));
}

#[test]
fn test_return_register_widening() {
    let ty = TypeDescriptor::primitive(Primitive::Int8);
    let mut slot = NativeArg::zeroed();
    slot.v_int8 = -3;
    let wide = widen_return(&ty, slot);
    assert_eq!(unsafe { wide.v_size } as i64, -3);
    assert_eq!(narrow_return(&ty, wide).get_int(storage(&ty)), Some(-3));

    let double = TypeDescriptor::double();
    let mut d = NativeArg::zeroed();
    d.v_double = 2.5;
    assert_eq!(unsafe { widen_return(&double, d).v_double }, 2.5);
}

#[test]
fn test_storage_classes() {
    assert_eq!(storage(&TypeDescriptor::int32()), Storage::I32);
    assert_eq!(storage(&TypeDescriptor::utf8()), Storage::Pointer);
    assert_eq!(native_size(&TypeDescriptor::boolean()), 4);
    let embedded = TypeDescriptor::embedded(Arc::new(
        CompoundInfo::new("Test", "Pair", HostType::INVALID, CompoundCategory::Struct).with_layout(12, 4),
    ));
    assert_eq!(native_size(&embedded), 12);
}

#[test]
fn test_native_error_records() {
    let raw = NativeError::new_raw(7, 3, "disk full");
    assert!(!raw.is_null());
    let (domain, code, message) = unsafe { NativeError::take_raw(raw) };
    assert_eq!((domain, code, message.as_str()), (7, 3, "disk full"));
}

#[test]
fn test_error_slot_to_script() {
    let types = SimpleTypeSystem::new();
    types.register_domain(7, "g-io-error");
    let reg = Registry::new(BindConfig::default(), Arc::new(types));
    let raw = NativeError::new_raw(7, 3, "disk full");

    let value = to_script(&reg, &TypeDescriptor::error(), Transfer::Everything, NativeArg::from_pointer(raw as *mut c_void), None)
        .unwrap();
    assert_eq!(
        value,
        Value::record([
            ("domain", Value::string("g-io-error")),
            ("code", Value::Int(3)),
            ("message", Value::string("disk full")),
        ])
    );
}

#[test]
fn test_process_library_symbols() {
    let lib = Library::this_process().unwrap();
    assert!(lib.symbol("malloc").is_ok());
    assert!(lib.symbol("gibind_definitely_missing").is_err());
    assert!(Library::load("libgibind-does-not-exist.so").is_err());
}
