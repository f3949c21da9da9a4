use x86::{bits64::vmx, vmx::VmFail};
use x86_64::registers::control::{Cr0, Cr4, Cr4Flags};

use super::detect::has_hardware_support;
use super::region::VmxRegion;
use crate::arch::msr::{cr_is_valid, FeatureControl, FeatureControlFlags, Msr, VmxBasic};
use crate::{HyperError, HyperResult, MkCraftHal};

/// VMX operation state of one physical core.
///
/// Teardown must run `vmxoff` before CR4.VMXE is cleared, and bring-up must
/// set CR4.VMXE before `vmxon`. Every step goes through [`VmxonState::step`],
/// which rejects any other order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxonState {
    /// CR4.VMXE clear, not in VMX operation.
    Off,
    /// CR4.VMXE set, not yet in VMX operation.
    CrEnabled,
    /// In VMX root operation.
    On,
}

/// A single hardware step of VMX bring-up or teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxonStep {
    /// Set CR4.VMXE.
    EnableCr4,
    /// Execute `vmxon`.
    Vmxon,
    /// Execute `vmxoff`.
    Vmxoff,
    /// Clear CR4.VMXE.
    DisableCr4,
}

impl VmxonState {
    /// Returns the state after `step`, or `BadState` if `step` is not legal
    /// from the current state.
    pub fn step(self, step: VmxonStep) -> HyperResult<Self> {
        match (self, step) {
            (Self::Off, VmxonStep::EnableCr4) => Ok(Self::CrEnabled),
            (Self::CrEnabled, VmxonStep::Vmxon) => Ok(Self::On),
            (Self::On, VmxonStep::Vmxoff) => Ok(Self::CrEnabled),
            (Self::CrEnabled, VmxonStep::DisableCr4) => Ok(Self::Off),
            (state, step) => {
                error!("illegal vmx transition {:?} from {:?}", step, state);
                Err(HyperError::BadState)
            }
        }
    }
}

/// State per vmx physical cpu.
pub struct VmxPerCpuState<H: MkCraftHal> {
    pub(crate) vmcs_revision_id: u32,
    vmx_region: Option<VmxRegion<H>>,
    state: VmxonState,
}

impl<H: MkCraftHal> VmxPerCpuState<H> {
    pub const fn new() -> Self {
        Self {
            vmcs_revision_id: 0,
            vmx_region: None,
            state: VmxonState::Off,
        }
    }

    /// Current VMX operation state of this core.
    pub fn state(&self) -> VmxonState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == VmxonState::On
    }

    fn advance(&mut self, step: VmxonStep) -> HyperResult {
        self.state = self.state.step(step)?;
        Ok(())
    }

    pub fn hardware_enable(&mut self) -> HyperResult {
        if !has_hardware_support() {
            return Err(HyperError::NotSupported);
        }
        if self.state != VmxonState::Off
            || Cr4::read().contains(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS)
        {
            return Err(HyperError::Disabled);
        }

        // Enable VMXON, if required.
        let ctrl = FeatureControl::read();
        let locked = ctrl.contains(FeatureControlFlags::LOCKED);
        let vmxon_outside = ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX);
        if !locked {
            FeatureControl::write(
                ctrl | FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX,
            )
        } else if !vmxon_outside {
            return Err(HyperError::NotSupported);
        }

        // Check control registers are in a VMX-friendly state.
        let cr0 = Cr0::read().bits();
        if !cr_is_valid(cr0, Msr::IA32_VMX_CR0_FIXED0.read(), Msr::IA32_VMX_CR0_FIXED1.read()) {
            return Err(HyperError::BadState);
        }
        let cr4 = Cr4::read().bits() | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
        if !cr_is_valid(cr4, Msr::IA32_VMX_CR4_FIXED0.read(), Msr::IA32_VMX_CR4_FIXED1.read()) {
            return Err(HyperError::BadState);
        }

        // Get VMCS revision identifier in IA32_VMX_BASIC MSR.
        let vmx_basic = VmxBasic::read();
        if vmx_basic.region_size as usize != H::PAGE_SIZE {
            return Err(HyperError::NotSupported);
        }
        if vmx_basic.mem_type != VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK {
            return Err(HyperError::NotSupported);
        }
        if vmx_basic.is_32bit_address {
            return Err(HyperError::NotSupported);
        }
        if !vmx_basic.io_exit_info {
            return Err(HyperError::NotSupported);
        }
        if !vmx_basic.vmx_flex_controls {
            return Err(HyperError::NotSupported);
        }
        self.vmcs_revision_id = vmx_basic.revision_id;
        let region = VmxRegion::new(vmx_basic.revision_id, false)?;
        let region_paddr = region.phys_addr();
        self.vmx_region = Some(region);

        // Enable VMX using the VMXE bit.
        self.advance(VmxonStep::EnableCr4)?;
        unsafe { Cr4::write(Cr4::read() | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS) };

        // Execute VMXON.
        let next = self.state.step(VmxonStep::Vmxon)?;
        if let Err(err) = unsafe { vmx::vmxon(region_paddr as _) } {
            self.advance(VmxonStep::DisableCr4)?;
            unsafe { Cr4::update(|cr4| cr4.remove(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS)) };
            self.vmx_region = None;
            return Err(err.into());
        }
        self.state = next;
        info!("[MK] successed to turn on VMX.");

        Ok(())
    }

    pub fn hardware_disable(&mut self) -> HyperResult {
        // Execute VMXOFF.
        let next = self.state.step(VmxonStep::Vmxoff)?;
        unsafe { vmx::vmxoff()? };
        self.state = next;

        // Remove VMXE bit in CR4.
        self.advance(VmxonStep::DisableCr4)?;
        unsafe { Cr4::update(|cr4| cr4.remove(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS)) };
        info!("[MK] successed to turn off VMX.");

        self.vmx_region = None;
        Ok(())
    }
}

impl From<VmFail> for HyperError {
    fn from(err: VmFail) -> Self {
        match err {
            VmFail::VmFailValid => HyperError::BadState,
            VmFail::VmFailInvalid => HyperError::InvalidParam,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmxoff_must_precede_cr4_clear() {
        let on = VmxonState::Off
            .step(VmxonStep::EnableCr4)
            .and_then(|s| s.step(VmxonStep::Vmxon))
            .unwrap();
        assert_eq!(on, VmxonState::On);

        assert_eq!(on.step(VmxonStep::DisableCr4), Err(HyperError::BadState));

        let cr_only = on.step(VmxonStep::Vmxoff).unwrap();
        assert_eq!(cr_only, VmxonState::CrEnabled);
        assert_eq!(cr_only.step(VmxonStep::DisableCr4), Ok(VmxonState::Off));
    }

    #[test]
    fn vmxon_requires_cr4() {
        assert_eq!(VmxonState::Off.step(VmxonStep::Vmxon), Err(HyperError::BadState));
        assert_eq!(VmxonState::Off.step(VmxonStep::Vmxoff), Err(HyperError::BadState));
        assert_eq!(
            VmxonState::CrEnabled.step(VmxonStep::EnableCr4),
            Err(HyperError::BadState)
        );
    }
}
