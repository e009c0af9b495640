//! Raw COM vtable calls

use std::ffi::c_void;

use gcap_sdk::{succeeded, vtable, Guid, QueryInterfaceFn, ReleaseFn, HRESULT};

use crate::error::{CaptureResult, CaptureSkip};

/// Read a method pointer out of a COM object's vtable
///
/// # Safety
/// - `object` must be a valid COM interface pointer
/// - `index` must be a valid vtable index and `F` its exact signature
#[inline]
pub(crate) unsafe fn method<F: Copy>(object: *mut c_void, index: usize) -> F {
    let vtable = *(object as *const *const *const c_void);
    std::mem::transmute_copy::<*const c_void, F>(&*vtable.add(index))
}

/// Map an HRESULT to a skip
pub(crate) fn check(call: &'static str, hr: HRESULT) -> CaptureResult<()> {
    if succeeded(hr) {
        Ok(())
    } else {
        Err(CaptureSkip::NativeCall { call, code: hr })
    }
}

/// IUnknown::QueryInterface
///
/// # Safety
/// `object` must be a valid COM interface pointer
pub(crate) unsafe fn query_interface(
    object: *mut c_void,
    iid: &Guid,
    call: &'static str,
) -> CaptureResult<*mut c_void> {
    let query: QueryInterfaceFn = method(object, vtable::QUERY_INTERFACE);
    let mut out = std::ptr::null_mut();
    check(call, query(object, iid, &mut out))?;
    if out.is_null() {
        return Err(CaptureSkip::NativeCall { call, code: 0 });
    }
    Ok(out)
}

/// IUnknown::Release
///
/// # Safety
/// `object` must be a valid COM interface pointer we hold a reference on
pub(crate) unsafe fn release(object: *mut c_void) {
    let release: ReleaseFn = method(object, vtable::RELEASE);
    release(object);
}

/// Hand-built COM objects for driving the readers in tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub const VTABLE_LEN: usize = 48;

    /// COM object layout: vtable pointer first, then test state
    #[repr(C)]
    pub struct FakeObject<S> {
        vtable: *const *const c_void,
        pub refs: AtomicU32,
        pub state: S,
        _table: Box<[*const c_void; VTABLE_LEN]>,
    }

    unsafe extern "system" fn add_ref<S>(this: *mut c_void) -> u32 {
        let object = &*(this as *const FakeObject<S>);
        object.refs.fetch_add(1, Ordering::Relaxed) + 1
    }

    unsafe extern "system" fn release_fake<S>(this: *mut c_void) -> u32 {
        let object = &*(this as *const FakeObject<S>);
        object.refs.fetch_sub(1, Ordering::Relaxed) - 1
    }

    unsafe extern "system" fn no_interface(_: *mut c_void, _: *const Guid, out: *mut *mut c_void) -> HRESULT {
        *out = std::ptr::null_mut();
        0x8000_4002u32 as i32
    }

    impl<S> FakeObject<S> {
        /// Build an object with the given `(index, fn)` vtable entries
        pub fn new(state: S, methods: &[(usize, *const c_void)]) -> Box<Self> {
            let mut table = Box::new([std::ptr::null::<c_void>(); VTABLE_LEN]);
            table[vtable::QUERY_INTERFACE] = no_interface as *const c_void;
            table[1] = add_ref::<S> as *const c_void;
            table[vtable::RELEASE] = release_fake::<S> as *const c_void;
            for (index, f) in methods {
                table[*index] = *f;
            }

            let mut object = Box::new(Self {
                vtable: std::ptr::null(),
                refs: AtomicU32::new(1),
                state,
                _table: table,
            });
            object.vtable = object._table.as_ptr();
            object
        }

        pub fn as_ptr(&self) -> *mut c_void {
            self as *const Self as *mut c_void
        }

        /// # Safety
        /// `this` must point at a `FakeObject<S>`
        pub unsafe fn from_ptr<'a>(this: *mut c_void) -> &'a Self {
            &*(this as *const Self)
        }

        pub fn refs(&self) -> u32 {
            self.refs.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeObject;
    use super::*;

    unsafe extern "system" fn answer(this: *mut c_void) -> u32 {
        FakeObject::<u32>::from_ptr(this).state
    }

    #[test]
    fn test_method_call_and_release() {
        let object = FakeObject::new(42u32, &[(5, answer as *const c_void)]);
        let f: unsafe extern "system" fn(*mut c_void) -> u32 = unsafe { method(object.as_ptr(), 5) };
        assert_eq!(unsafe { f(object.as_ptr()) }, 42);

        unsafe { release(object.as_ptr()) };
        assert_eq!(object.refs(), 0);
    }

    #[test]
    fn test_query_interface_failure() {
        let object = FakeObject::new((), &[]);
        let result = unsafe { query_interface(object.as_ptr(), &gcap_sdk::IID_IDXGI_RESOURCE, "QueryInterface") };
        assert!(matches!(result, Err(CaptureSkip::NativeCall { call: "QueryInterface", .. })));
    }

    #[test]
    fn test_check() {
        assert!(check("Present", 0).is_ok());
        assert_eq!(
            check("Present", -1),
            Err(CaptureSkip::NativeCall { call: "Present", code: -1 })
        );
    }
}
