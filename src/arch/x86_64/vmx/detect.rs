use raw_cpuid::CpuId;

/// Returns true if this core is an Intel part that reports VMX.
pub fn has_hardware_support() -> bool {
    let cpuid = CpuId::new();
    let intel = cpuid
        .get_vendor_info()
        .map_or(false, |vendor| vendor.as_str() == "GenuineIntel");
    let vmx = cpuid.get_feature_info().map_or(false, |feature| feature.has_vmx());
    if !vmx {
        warn!("[MK] cpu does not report vmx");
    }
    intel && vmx
}
