use serde::{
    de::Unexpected, ser::SerializeStruct, Deserialize, Serialize, Serializer,
};

use super::Cpu;
use crate::address::Address;

// The integer registers are packed big-endian into one byte buffer,
// A::BYTES per slot. The PC is stored where x0 would be, since x0
// never holds data.

impl<A: Address> Serialize for Cpu<A> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let has_float = cfg!(feature = "float");
        let mut state = serializer.serialize_struct(
            "SerializedCpu",
            if has_float { 6 } else { 4 },
        )?;
        let mut buf = [0u8; 512];
        let mut out_n = 0;
        for slot in 0..32 {
            let value = if slot == 0 {
                self.pc.to_u128()
            } else {
                self.regs[slot].to_u128()
            };
            let bytes = value.to_be_bytes();
            buf[out_n..out_n + A::BYTES]
                .copy_from_slice(&bytes[16 - A::BYTES..]);
            out_n += A::BYTES;
        }
        state.serialize_field("registers", &buf[..out_n])?;
        state.serialize_field("address_bytes", &(A::BYTES as u8))?;
        state.serialize_field("counter", &self.counter)?;
        state.serialize_field("max_counter", &self.max_counter)?;
        #[cfg(feature = "float")]
        {
            state.serialize_field("fcsr", &(self.fcsr as u8))?;
            out_n = 0;
            for slot in 0..32 {
                buf[out_n..out_n + 8]
                    .copy_from_slice(&self.fregs[slot].to_be_bytes());
                out_n += 8;
            }
            state.serialize_field("float_registers", &buf[..out_n])?;
        }
        state.end()
    }
}

// Writing the deserializer by hand would be an enormous PITA, and
// deserializing is much less performance-critical than serializing,
// so a derived deserializer plus an intermediate struct does the job.
// There are two intermediate structs because the float feature
// changes the field set, and some formats predicate on field names.

mod nofloat {
    use super::*;
    #[derive(Deserialize)]
    pub struct SerializedCpu {
        pub registers: Vec<u8>,
        pub address_bytes: u8,
        pub counter: u64,
        pub max_counter: u64,
    }
}

mod yesfloat {
    use super::*;
    #[derive(Deserialize)]
    pub struct SerializedCpu {
        pub registers: Vec<u8>,
        pub address_bytes: u8,
        pub counter: u64,
        pub max_counter: u64,
        pub fcsr: u8,
        pub float_registers: Vec<u8>,
    }
}

impl<'de, A: Address> Deserialize<'de> for Cpu<A> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let mut ret: Self = Self::new();
        let (registers, address_bytes, counter, max_counter);
        #[allow(unused_variables)]
        let (fcsr, float_registers): (u8, Vec<u8>);
        if cfg!(feature = "float") {
            let intermediate =
                yesfloat::SerializedCpu::deserialize(deserializer)?;
            registers = intermediate.registers;
            address_bytes = intermediate.address_bytes;
            counter = intermediate.counter;
            max_counter = intermediate.max_counter;
            fcsr = intermediate.fcsr;
            float_registers = intermediate.float_registers;
        } else {
            let intermediate =
                nofloat::SerializedCpu::deserialize(deserializer)?;
            registers = intermediate.registers;
            address_bytes = intermediate.address_bytes;
            counter = intermediate.counter;
            max_counter = intermediate.max_counter;
            fcsr = 0;
            float_registers = vec![];
        }
        if address_bytes as usize != A::BYTES {
            return Err(Error::invalid_value(
                Unexpected::Unsigned(address_bytes as u64),
                &"an address width matching this machine's configuration",
            ));
        }
        if registers.len() != 32 * A::BYTES {
            return Err(Error::invalid_length(
                registers.len(),
                &"32 packed integer registers",
            ));
        }
        if cfg!(feature = "float") && float_registers.len() != 32 * 8 {
            return Err(Error::invalid_length(
                float_registers.len(),
                &"32 packed 64-bit float registers",
            ));
        }
        for (slot, bytes) in registers.chunks_exact(A::BYTES).enumerate() {
            let mut wide = [0u8; 16];
            wide[16 - A::BYTES..].copy_from_slice(bytes);
            let value = A::from_u128(u128::from_be_bytes(wide));
            if slot == 0 {
                ret.pc = value;
            } else {
                ret.regs[slot] = value;
            }
        }
        ret.counter = counter;
        ret.max_counter = max_counter;
        #[cfg(feature = "float")]
        {
            ret.fcsr = fcsr as u32;
            for (slot, bytes) in float_registers.chunks_exact(8).enumerate() {
                let mut be = [0u8; 8];
                be.copy_from_slice(bytes);
                ret.fregs[slot] = u64::from_be_bytes(be);
            }
        }
        Ok(ret)
    }
}
