pub mod droidagent {
    pub mod v1 {
        tonic::include_proto!("droidagent.v1");
    }
}

pub mod android {
    pub mod emulation {
        pub mod control {
            tonic::include_proto!("android.emulation.control");
        }
    }
}
