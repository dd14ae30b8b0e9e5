//! EON EN25QH series.

use blocks::{Error, Result};

use crate::{cmds::*, device::Device, sfdp, Inst};

pub struct Eon;

impl Device for Eon {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        // 0x1C 0x70 0x18  EN25QH128A
        if id[0] == MFG_ID_EON && id[2] == 0x18 {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn read_apply_para(&self, inst: &mut Inst) -> Result {
        sfdp::read_apply_para(inst)?;
        // SFDP reports the wrong dummy count for the 1-4-4 read command.
        if inst.cmd_read == CMD_QUAD_READ {
            inst.num_bytes_read_dummy = 3;
        }
        Ok(())
    }
}
