//! Class table, lazy class supply and module unload tests.

mod common;

use common::*;
use kernobjc::{Class, Error, Imp, Object, Receiver, SelectorId};

fn module_imp(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
    10
}

fn patched_imp(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
    20
}

fn patch_to_stub(_: Imp) -> Imp {
    patched_imp
}

fn unpatched_imp(_: Receiver, _: SelectorId, _: &[usize]) -> usize {
    30
}

// Publishes a class whose only method lives in a region that is then
// unloaded without a patch hook.
fn unloaded_without_hook(rt: &kernobjc::Runtime, name: &str) -> (Receiver, SelectorId) {
    let class = create_root_class("Unpatched");
    let method = rt.add_method(class, name, WORD, unpatched_imp).unwrap();
    class.finish();
    rt.classes().publish(class).unwrap();

    let receiver = Receiver::from(Object::allocate(class));
    assert_eq!(rt.send(receiver, method.selector(), &[]), 30);

    let address = unpatched_imp as usize;
    assert_eq!(rt.classes().patch_unloaded_region(address..address + 1), 1);
    (receiver, method.selector())
}

#[test]
fn test_publish_lookup_unpublish() {
    let rt = create_runtime();
    let class = create_root_class("Published");
    class.finish();

    rt.classes().publish(class).unwrap();
    assert_eq!(rt.classes().class_for_name(class.name()), Some(class));
    assert_eq!(rt.classes().required_class(class.name()), class);

    assert!(rt.classes().unpublish(class));
    assert!(rt.classes().class_for_name(class.name()).is_none());
}

#[test]
fn test_provider_supplies_classes_on_demand() {
    fn provider(name: &str) -> Option<Class> {
        if name != "LazilyLoaded" {
            return None;
        }
        let class = Class::new_root(name);
        class.finish();
        Some(class)
    }

    let rt = create_runtime();
    rt.classes().set_class_provider(provider);

    let class = rt.classes().class_for_name("LazilyLoaded").unwrap();
    assert_eq!(rt.classes().len(), 1);
    // The second lookup is served from the table.
    assert_eq!(rt.classes().class_for_name("LazilyLoaded"), Some(class));

    rt.classes().clear_class_provider();
    assert!(rt.classes().class_for_name("NeverLoaded").is_none());
}

#[test]
fn test_can_unload_refuses_dependent_subclasses() {
    let rt = create_runtime();
    let base = create_root_class("KernelBase");
    base.finish();
    let module_class = create_subclass("ModuleClass", base);
    module_class.finish();
    let dependent = create_subclass("Dependent", module_class);
    dependent.finish();

    for class in [base, module_class, dependent] {
        rt.classes().publish(class).unwrap();
    }

    assert!(!rt.classes().can_unload(&[module_class]));
    rt.classes().unpublish(dependent);
    assert!(rt.classes().can_unload(&[module_class]));
}

#[test]
fn test_patched_methods_redirect_warm_sends() {
    let rt = create_runtime();
    let class = create_root_class("Unloading");
    let method = rt.add_method(class, "work", WORD, module_imp).unwrap();
    class.finish();
    rt.classes().publish(class).unwrap();
    rt.classes().set_unloaded_imp_patch(patch_to_stub);

    let receiver = Receiver::from(Object::allocate(class));
    let sel = method.selector();
    assert_eq!(rt.send(receiver, sel, &[]), 10);

    let address = module_imp as usize;
    assert_eq!(rt.classes().patch_unloaded_region(address..address + 1), 1);
    assert_eq!(rt.send(receiver, sel, &[]), 20);
    assert_eq!(rt.selectors().name_of(sel), "work");
}

#[test]
fn test_unloaded_method_error_names_selector() {
    let rt = create_runtime();
    let (receiver, sel) = unloaded_without_hook(&rt, "drain");

    assert_eq!(
        rt.try_send(receiver, sel, &[]),
        Err(Error::MethodInUnloadedRegion {
            selector: "drain".to_string()
        })
    );
}

#[test]
#[should_panic(expected = "Method 'flushQueue' was called after its code was unloaded")]
fn test_unloaded_method_send_aborts_with_name() {
    let rt = create_runtime();
    let (receiver, sel) = unloaded_without_hook(&rt, "flushQueue");
    rt.send(receiver, sel, &[]);
}

#[test]
#[should_panic(expected = "Method 'rebuild' was called after its code was unloaded")]
fn test_unloaded_method_lookup_imp_aborts_with_name() {
    let rt = create_runtime();
    let (receiver, sel) = unloaded_without_hook(&rt, "rebuild");
    let _ = rt.lookup_imp(receiver, sel);
}
