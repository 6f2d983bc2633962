//! Solidity ABI bindings for the token, the Gateway wallet and minter
//! contracts, and the destination treasury.

use alloy::sol;

sol!(
    #![sol(all_derives = true)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
);

sol!(
    #![sol(all_derives = true)]
    interface IGatewayWallet {
        function deposit(address token, uint256 value) external;
        function depositFor(address token, address depositor, uint256 value) external;
        function availableBalance(address token, address depositor) external view returns (uint256);
    }
);

sol!(
    #![sol(all_derives = true)]
    interface IGatewayMinter {
        function gatewayMint(bytes attestationPayload, bytes signature) external;
    }
);

sol!(
    #![sol(all_derives = true)]
    interface ITreasury {
        function depositToTreasury(uint256 amount) external;
    }
);
