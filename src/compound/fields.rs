//! In-place access to record fields

use super::{Compound, Posture, UnwrapFlags};
use crate::descriptor::{DescriptorKind, FieldInfo, Transfer};
use crate::errors::{BindError, Result};
use crate::interop::frame::CallFrame;
use crate::interop::marshal;
use crate::interop::types::{read_slot, write_slot, NativeArg};
use crate::lifetime::Registry;
use crate::value::Value;

impl Compound {
    fn field_info(&self, name: &str) -> Result<&FieldInfo> {
        self.info().field(name).ok_or_else(|| {
            BindError::type_mismatch(
                format!("field of {}", self.info().qualified_name()),
                format!("'{}'", name),
            )
        })
    }

    /// Read a field
    ///
    /// Embedded records come back as `Parent` wrappers keeping this one alive.
    pub fn field(&self, reg: &Registry, name: &str) -> Result<Value> {
        let field = self.field_info(name)?;
        let address = self.address()? + field.offset;

        if let (DescriptorKind::Compound(info), false) = (&field.ty.kind, field.ty.pointer) {
            let sub = Compound::wrap(reg, info, address, Posture::Parent, Some(self))?;
            return Ok(Value::Compound(sub));
        }

        // Safety: offset lies within the live storage described by the field table
        let slot = unsafe { read_slot(&field.ty, address as *const u8)? };
        marshal::to_script(reg, &field.ty, Transfer::None, slot, Some(self))
    }

    /// Assign a field
    ///
    /// Pointer-valued fields take ownership of what they are given (strings
    /// are duplicated, records relinquished).
    pub fn set_field(&self, reg: &Registry, name: &str, value: &Value) -> Result<()> {
        let field = self.field_info(name)?;
        if !field.writable {
            return Err(BindError::type_mismatch(
                "writable field",
                format!("read-only field '{}'", name),
            ));
        }
        let address = self.address()? + field.offset;

        if let (DescriptorKind::Compound(info), false) = (&field.ty.kind, field.ty.pointer) {
            let target = Compound::wrap_transient(reg, info, address, Posture::Parent, Some(self))?;
            return match value {
                Value::Record(map) => {
                    for (sub_name, sub_value) in map.iter() {
                        target.set_field(reg, sub_name, sub_value)?;
                    }
                    Ok(())
                }
                _ => {
                    let source = Compound::unwrap(reg, value, info, UnwrapFlags::empty())?;
                    // Safety: both regions hold an instance of `info`
                    unsafe {
                        std::ptr::copy(
                            source.address as *const u8,
                            address as *mut u8,
                            info.size,
                        );
                    }
                    Ok(())
                }
            };
        }

        let mut frame = CallFrame::new(reg);
        let mut slot = NativeArg::zeroed();
        marshal::to_native(reg, &mut frame, &field.ty, Transfer::Everything, value, None, &mut slot)
            .map_err(|e| e.in_callable(format!("{}.{}", self.info().qualified_name(), name)))?;
        // Safety: see field()
        unsafe { write_slot(&field.ty, address as *mut u8, slot)? };
        frame.commit();
        Ok(())
    }
}
