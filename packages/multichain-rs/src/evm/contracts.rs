//! EVM bridge contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the multisig bridge,
//! the ERC20 safe, the smart-contract execution proxy and plain ERC20 tokens.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Deposit as stored by the bridge for a pending batch
    #[derive(Debug)]
    struct Deposit {
        uint256 nonce;
        address tokenAddress;
        uint256 amount;
        address depositor;
        bytes32 recipient;
        uint8 status;
    }

    /// Batch header plus its deposits; `nonce == 0` means no batch
    #[derive(Debug)]
    struct Batch {
        uint256 nonce;
        uint256 timestamp;
        uint256 lastUpdatedBlockNumber;
        Deposit[] deposits;
    }

    /// Multisig bridge: relayer whitelist, quorum and batch execution
    #[sol(rpc)]
    contract Bridge {
        function executeTransfer(
            address[] tokens,
            address[] recipients,
            uint256[] amounts,
            uint256 batchNonce,
            bytes[] signatures
        ) external;

        function finishCurrentPendingBatch(
            uint256 batchNonce,
            uint8[] newDepositStatuses,
            bytes[] signatures
        ) external;

        function getNextPendingBatch() external view returns (Batch memory);

        function getBatch(uint256 batchNonce) external view returns (Batch memory);

        function wasBatchExecuted(uint256 batchNonce) external view returns (bool);

        function wasBatchFinished(uint256 batchNonce) external view returns (bool);

        function getStatusesAfterExecution(uint256 batchNonce) external view returns (uint8[] memory);

        function quorum() external view returns (uint256);

        function getRelayers() external view returns (address[] memory);

        function paused() external view returns (bool);
    }

    /// Token custody and per-token bridging policy
    #[sol(rpc)]
    contract ERC20Safe {
        function isTokenWhitelisted(address token) external view returns (bool);

        function mintBurnTokens(address token) external view returns (bool);

        function nativeTokens(address token) external view returns (bool);
    }

    /// Emits the call data of deposits addressed to MultiversX smart contracts
    #[sol(rpc)]
    contract SCExecProxy {
        event ERC20SCDeposit(uint64 indexed batchNonce, uint256 depositNonce, string callData);
    }

    #[sol(rpc)]
    contract ERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function symbol() external view returns (string);
    }
}
